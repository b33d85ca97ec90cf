use super::*;
use crate::config::{JudgeDefaults, PipelineConfig};
use crate::llm::LlmError;
use crate::model::ValidationNotes;
use crate::test_support::{FnModel, ScriptedModel, document, record, scores_reply};

fn page(strategy: &str, page_number: u32, passed: bool, text: &str) -> PageValidation {
    PageValidation {
        page_number,
        strategy: strategy.to_string(),
        passed,
        confidence: if passed { 0.9 } else { 0.1 },
        fallback_path: Vec::new(),
        fallback_attempts: 0,
        processing_time_ms: 20.0,
        notes: ValidationNotes {
            page_text: text.to_string(),
            ..ValidationNotes::default()
        },
    }
}

fn axes(read: f64, sentence: f64, noise: f64, table: f64, figure: f64) -> AxisScores {
    AxisScores {
        read,
        sentence,
        noise,
        table,
        figure,
    }
}

#[test]
fn uniform_scores_total_to_the_same_value() {
    let total = weighted_total(&axes(80.0, 80.0, 80.0, 80.0, 80.0), &JudgeWeights::default());
    assert!((total - 80.0).abs() < 1e-9);
}

#[test]
fn missing_table_and_figure_cost_their_weight() {
    let total = weighted_total(&axes(100.0, 100.0, 100.0, 0.0, 0.0), &JudgeWeights::default());
    assert!((total - 65.0).abs() < 1e-9);
}

#[test]
fn grade_boundaries() {
    let thresholds = GradeThresholds::default();
    assert_eq!(grade_for(85.0, &thresholds), Grade::Pass);
    assert_eq!(grade_for(84.999, &thresholds), Grade::Borderline);
    assert_eq!(grade_for(70.0, &thresholds), Grade::Borderline);
    assert_eq!(grade_for(69.999, &thresholds), Grade::Fail);
}

#[test]
fn quality_reply_is_clamped_and_defaults_fill_gaps() {
    let defaults = JudgeDefaults::default();
    let parsed = parse_quality_response(
        "```json\n{\"S_read\": 130, \"S_sent\": -4, \"S_noise\": \"88\", \"rationale\": \"clean\", \"comments\": {\"read\": \"fine\", \"table\": 3}}\n```",
        &defaults,
    );
    assert_eq!(parsed.scores, axes(100.0, 0.0, 88.0, 85.0, 80.0));
    assert_eq!(parsed.rationale, "clean");
    assert_eq!(parsed.comments.get("read").map(String::as_str), Some("fine"));
    assert_eq!(parsed.comments.get("table").map(String::as_str), Some("3"));
}

#[test]
fn unparseable_quality_reply_gets_default_scores() {
    let parsed = parse_quality_response("the page is lovely", &JudgeDefaults::default());
    assert_eq!(parsed.scores, axes(75.0, 75.0, 75.0, 85.0, 80.0));
    assert!(parsed.rationale.starts_with("Failed to parse quality response"));
    assert!(parsed.comments.is_empty());
}

#[test]
fn prompt_truncates_page_text() {
    let text = "x".repeat(1500);
    let prompt = quality_prompt("doc.pdf", "pdftotext", 3, &text, 2, 1000);
    assert!(prompt.contains(&"x".repeat(1000)));
    assert!(!prompt.contains(&"x".repeat(1001)));
    assert!(prompt.contains("Tables: 2"));
}

#[test]
fn only_passing_pages_of_passing_strategies_are_scored() {
    let config = PipelineConfig::default();
    let model = FnModel::new(|prompt: &str| {
        if prompt.contains("weak page") {
            scores_reply(70.0)
        } else {
            scores_reply(90.0)
        }
    });
    let judge = Judge::new(&model, &config);

    let partial = StrategyValidation::from_pages(
        "partial",
        vec![
            page("partial", 1, true, "strong page"),
            page("partial", 2, false, "never shown to the judge"),
            page("partial", 3, true, "weak page"),
        ],
    );
    let failed = StrategyValidation::from_pages("failed", vec![page("failed", 1, false, "")]);
    let records = vec![record("partial", &["a", "b", "c"]), record("failed", &[""])];

    let judgments = judge.judge(&document(), &[partial, failed], &records, &CancelFlag::new());

    assert_eq!(judgments.len(), 1);
    assert_eq!(model.calls(), 2);
    let judgment = &judgments[0];
    assert_eq!(judgment.strategy, "partial");
    assert_eq!(judgment.pages.len(), 2);
    assert!((judgment.total - 80.0).abs() < 1e-9);
    assert!((judgment.scores.read - 80.0).abs() < 1e-9);
    assert_eq!(judgment.grade, Grade::Borderline);
    // 30 ms of extraction plus 3 x 20 ms of validation over 3 pages.
    assert!((judgment.speed_ms_per_page - 30.0).abs() < 1e-9);
}

#[test]
fn quality_call_failure_falls_back_to_defaults() {
    let config = PipelineConfig::default();
    let model = ScriptedModel::new(vec![Err(LlmError::EmptyResponse)]);
    let judge = Judge::new(&model, &config);

    let judged = judge.judge_page(&document(), &page("tool", 1, true, "some page text"));
    assert_eq!(judged.scores, axes(75.0, 75.0, 75.0, 85.0, 80.0));
    assert!((judged.total - 78.0).abs() < 1e-9);
    assert_eq!(judged.grade, Grade::Borderline);
    assert!(judged.rationale.contains("empty_response"));
}

#[test]
fn cancelled_run_judges_nothing() {
    let config = PipelineConfig::default();
    let model = ScriptedModel::new(Vec::new());
    let judge = Judge::new(&model, &config);
    let cancel = CancelFlag::new();
    cancel.cancel();

    let validation = StrategyValidation::from_pages("tool", vec![page("tool", 1, true, "text")]);
    let judgments = judge.judge(&document(), &[validation], &[], &cancel);
    assert!(judgments.is_empty());
    assert_eq!(model.calls(), 0);
}
