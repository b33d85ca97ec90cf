use super::*;
use crate::config::PipelineConfig;
use crate::extract::ToolRegistry;
use crate::llm::LlmError;
use crate::model::FallbackKind::{LayoutReorder, PageSplit, TableEnhancement};
use crate::test_support::{FnModel, ScriptedModel, document, marker_fallbacks, record, verdict_reply};

const GOOD_TEXT: &str = "Revenue grew twelve percent year over year on strong deposits.";

fn no_tools() -> ToolRegistry {
    ToolRegistry::new(Vec::new())
}

#[test]
fn parse_rejects_non_json_reply() {
    let verdict = parse_validation_response("I think this page looks fine overall.");
    assert!(!verdict.passed);
    assert_eq!(verdict.confidence, 0.0);
    assert_eq!(verdict.issues, vec!["parse_error".to_string()]);
    assert!(verdict.suggestions.is_empty());
}

#[test]
fn parse_reads_fenced_reply_and_defaults_missing_fields() {
    let verdict = parse_validation_response("```json\n{\"reason\": \"columns mixed\", \"suggestions\": [\"layout_reorder\"]}\n```");
    assert!(!verdict.passed);
    assert_eq!(verdict.confidence, 0.5);
    assert_eq!(verdict.reason, "columns mixed");
    assert_eq!(verdict.suggestions, vec!["layout_reorder".to_string()]);

    let verdict = parse_validation_response("{\"pass\": true, \"confidence\": 1.7}");
    assert!(verdict.passed);
    assert_eq!(verdict.confidence, 1.0);
}

#[test]
fn parse_rejects_json_that_is_not_an_object() {
    let verdict = parse_validation_response("[true, 0.9]");
    assert!(!verdict.passed);
    assert_eq!(verdict.issues, vec!["parse_error".to_string()]);
}

#[test]
fn default_plan_is_singles_then_pairs() {
    let plan = combination_plan(&[], &FallbackKind::ALL, &FallbackSearchConfig::default());
    assert_eq!(
        plan,
        vec![
            vec![PageSplit],
            vec![LayoutReorder],
            vec![TableEnhancement],
            vec![PageSplit, LayoutReorder],
            vec![PageSplit, TableEnhancement],
            vec![LayoutReorder, TableEnhancement],
        ]
    );
}

#[test]
fn suggestions_reorder_the_plan() {
    let suggestions = vec![
        "Apply TABLE enhancement".to_string(),
        "레이아웃 재정렬 필요".to_string(),
        "표 and table again".to_string(),
    ];
    let plan = combination_plan(&suggestions, &FallbackKind::ALL, &FallbackSearchConfig::default());
    assert_eq!(plan[0], vec![TableEnhancement]);
    assert_eq!(plan[1], vec![LayoutReorder]);
    assert_eq!(plan[2], vec![PageSplit]);
    assert_eq!(plan[3], vec![TableEnhancement, LayoutReorder]);
    assert_eq!(plan.len(), 6);
}

#[test]
fn plan_skips_unavailable_tools_and_respects_cap() {
    let available = [LayoutReorder];
    let plan = combination_plan(&["split the page".to_string()], &available, &FallbackSearchConfig::default());
    assert_eq!(plan, vec![vec![LayoutReorder]]);

    let search = FallbackSearchConfig {
        max_combinations: 4,
        ..FallbackSearchConfig::default()
    };
    assert_eq!(combination_plan(&[], &FallbackKind::ALL, &search).len(), 4);
}

#[test]
fn short_text_fails_without_calling_the_judge() {
    let config = PipelineConfig::default();
    let fallbacks = crate::fallback::FallbackRegistry::empty();
    let tools = no_tools();
    let available = ScriptedModel::new(vec![verdict_reply(true, 1.0)]);
    let unavailable = FnModel::new(|_: &str| Err(LlmError::EmptyResponse));

    for model in [&available as &dyn ChatModel, &unavailable as &dyn ChatModel] {
        let validator = Validator::new(model, &fallbacks, &tools, &config);
        let extraction = record("tool", &["   too short   "]);
        let result = validator.validate_page(&document(), &extraction, &extraction.pages[0], &CancelFlag::new());

        assert!(!result.passed);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.fallback_attempts, 0);
        assert_eq!(result.notes.issues, vec!["insufficient_text".to_string()]);
    }
    assert_eq!(available.calls(), 0);
    assert_eq!(unavailable.calls(), 0);
}

#[test]
fn passing_page_has_no_fallback_path() {
    let config = PipelineConfig::default();
    let fallbacks = marker_fallbacks();
    let tools = no_tools();
    let model = ScriptedModel::new(vec![verdict_reply(true, 0.9)]);
    let validator = Validator::new(&model, &fallbacks, &tools, &config);
    let extraction = record("tool", &[GOOD_TEXT]);

    let result = validator.validate_page(&document(), &extraction, &extraction.pages[0], &CancelFlag::new());
    assert!(result.passed);
    assert!(result.fallback_path.is_empty());
    assert_eq!(result.notes.page_text, GOOD_TEXT);
    assert_eq!(model.calls(), 1);
}

#[test]
fn search_stops_at_the_first_passing_combination() {
    let config = PipelineConfig::default();
    let fallbacks = marker_fallbacks();
    let tools = no_tools();
    let plan = combination_plan(&[], &fallbacks.available(), &config.fallback);

    for k in 1..=plan.len() {
        let mut replies = vec![verdict_reply(false, 0.05)];
        for step in 1..k {
            replies.push(verdict_reply(false, 0.05 + step as f64 * 0.1));
        }
        replies.push(verdict_reply(true, 0.95));
        for _ in k..plan.len() {
            replies.push(verdict_reply(true, 0.99));
        }

        let model = ScriptedModel::new(replies);
        let validator = Validator::new(&model, &fallbacks, &tools, &config);
        let extraction = record("tool", &[GOOD_TEXT]);
        let result = validator.validate_page(&document(), &extraction, &extraction.pages[0], &CancelFlag::new());

        assert!(result.passed, "k={k}");
        assert_eq!(model.calls(), 1 + k, "k={k}");
        assert_eq!(result.fallback_attempts, k);
        assert_eq!(result.fallback_path, plan[k - 1]);
        assert_eq!(result.confidence, 0.95);
    }
}

#[test]
fn search_stops_early_once_confidence_stalls() {
    let config = PipelineConfig::default();
    let fallbacks = marker_fallbacks();
    let tools = no_tools();
    let model = ScriptedModel::new(vec![
        verdict_reply(false, 0.5),
        verdict_reply(false, 0.6),
        verdict_reply(false, 0.4),
        verdict_reply(false, 0.3),
        verdict_reply(true, 0.9),
    ]);
    let validator = Validator::new(&model, &fallbacks, &tools, &config);
    let extraction = record("tool", &[GOOD_TEXT]);

    let result = validator.validate_page(&document(), &extraction, &extraction.pages[0], &CancelFlag::new());
    assert!(!result.passed);
    assert_eq!(model.calls(), 4);
    assert_eq!(result.fallback_attempts, 3);
    assert_eq!(result.confidence, 0.6);
    assert_eq!(result.fallback_path, vec![PageSplit]);
    assert!(result.notes.page_text.ends_with("[split]"));
}

#[test]
fn plateau_handling_is_configurable() {
    let fallbacks = marker_fallbacks();
    let tools = no_tools();
    let extraction = record("tool", &[GOOD_TEXT]);

    let strict = PipelineConfig::default();
    let model = FnModel::new(|_: &str| verdict_reply(false, 0.5));
    let validator = Validator::new(&model, &fallbacks, &tools, &strict);
    let result = validator.validate_page(&document(), &extraction, &extraction.pages[0], &CancelFlag::new());
    assert_eq!(result.fallback_attempts, 3);
    assert!(result.fallback_path.is_empty());

    let mut lenient = PipelineConfig::default();
    lenient.fallback.plateau_is_no_improvement = false;
    let model = FnModel::new(|_: &str| verdict_reply(false, 0.5));
    let validator = Validator::new(&model, &fallbacks, &tools, &lenient);
    let result = validator.validate_page(&document(), &extraction, &extraction.pages[0], &CancelFlag::new());
    assert_eq!(result.fallback_attempts, 6);
    assert_eq!(model.calls(), 7);
}

#[test]
fn unreachable_judge_never_passes() {
    let config = PipelineConfig::default();
    let fallbacks = marker_fallbacks();
    let tools = no_tools();
    let model = FnModel::new(|_: &str| Err(LlmError::Status {
        status: 503,
        body: "overloaded".to_string(),
    }));
    let validator = Validator::new(&model, &fallbacks, &tools, &config);
    let extraction = record("tool", &[GOOD_TEXT]);

    let result = validator.validate_page(&document(), &extraction, &extraction.pages[0], &CancelFlag::new());
    assert!(!result.passed);
    assert_eq!(result.confidence, 0.0);
    assert_eq!(result.notes.issues, vec!["http_status".to_string()]);
}

#[test]
fn strategy_passes_only_when_every_page_passes() {
    let config = PipelineConfig::default();
    let fallbacks = crate::fallback::FallbackRegistry::empty();
    let tools = no_tools();
    let model = FnModel::new(|prompt: &str| verdict_reply(!prompt.contains("garbled"), 0.8));
    let validator = Validator::new(&model, &fallbacks, &tools, &config);

    let records = vec![
        record("clean", &[GOOD_TEXT, GOOD_TEXT]),
        record("mixed", &[GOOD_TEXT, "garbled columns interleaved beyond repair"]),
    ];
    let report = validator.validate(&document(), &records, &CancelFlag::new());

    assert_eq!(report.strategies.len(), 2);
    for strategy in &report.strategies {
        assert_eq!(strategy.passed, strategy.pages.iter().all(|page| page.passed));
    }
    assert!(report.strategies[0].passed);
    assert!(!report.strategies[1].passed);
    assert_eq!(report.failed_combinations.len(), 1);
    assert_eq!(report.failed_combinations[0].strategy, "mixed");
    assert_eq!(report.failed_combinations[0].page_pass_rate, 0.5);
}

#[test]
fn failed_records_are_not_validated() {
    let config = PipelineConfig::default();
    let fallbacks = crate::fallback::FallbackRegistry::empty();
    let tools = no_tools();
    let model = ScriptedModel::new(Vec::new());
    let validator = Validator::new(&model, &fallbacks, &tools, &config);

    let failed = ExtractionRecord::failed("broken", "0".to_string(), "boom".to_string(), 1.0);
    let report = validator.validate(&document(), &[failed], &CancelFlag::new());
    assert!(report.strategies.is_empty());
    assert_eq!(model.calls(), 0);
}

#[test]
fn fallback_output_below_the_floor_is_not_judged() {
    let config = PipelineConfig::default();
    let fallbacks = marker_fallbacks();
    let tools = no_tools();
    let model = FnModel::new(|_: &str| verdict_reply(true, 1.0));
    let validator = Validator::new(&model, &fallbacks, &tools, &config);
    let extraction = record("tool", &[""]);

    let result = validator.validate_page(&document(), &extraction, &extraction.pages[0], &CancelFlag::new());
    assert!(!result.passed);
    assert_eq!(model.calls(), 0);
    assert_eq!(result.fallback_attempts, 3);
    assert!(result.fallback_path.is_empty());
}
