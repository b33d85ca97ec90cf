use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::{FallbackSearchConfig, PipelineConfig};
use crate::extract::ToolRegistry;
use crate::fallback::{CombinationOutcome, FallbackRegistry};
use crate::llm::ChatModel;
use crate::model::{
    DocumentSource, ExtractionRecord, FailedCombination, FallbackKind, PageExtraction, PageRecord,
    PageValidation, StrategyValidation, ValidationNotes, strategy_label,
};
use crate::pipeline::CancelFlag;
use crate::util::{elapsed_ms, now_utc_string};

mod prompt;

pub use prompt::{Verdict, parse_validation_response, validation_prompt};

/// Suggestion keywords, checked in order, and the fallback each one names.
const SUGGESTION_KEYWORDS: [(&str, FallbackKind); 12] = [
    ("custom_split", FallbackKind::PageSplit),
    ("page_split", FallbackKind::PageSplit),
    ("split", FallbackKind::PageSplit),
    ("좌우", FallbackKind::PageSplit),
    ("분할", FallbackKind::PageSplit),
    ("layout", FallbackKind::LayoutReorder),
    ("layout_reorder", FallbackKind::LayoutReorder),
    ("레이아웃", FallbackKind::LayoutReorder),
    ("table", FallbackKind::TableEnhancement),
    ("table_enhancement", FallbackKind::TableEnhancement),
    ("표", FallbackKind::TableEnhancement),
    ("column", FallbackKind::LayoutReorder),
];

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub strategies: Vec<StrategyValidation>,
    pub failed_combinations: Vec<FailedCombination>,
}

struct Attempt {
    path: Vec<FallbackKind>,
    verdict: Verdict,
    page: PageRecord,
}

pub struct Validator<'a> {
    model: &'a dyn ChatModel,
    fallbacks: &'a FallbackRegistry,
    tools: &'a ToolRegistry,
    config: &'a PipelineConfig,
}

impl<'a> Validator<'a> {
    pub fn new(
        model: &'a dyn ChatModel,
        fallbacks: &'a FallbackRegistry,
        tools: &'a ToolRegistry,
        config: &'a PipelineConfig,
    ) -> Self {
        Self {
            model,
            fallbacks,
            tools,
            config,
        }
    }

    pub fn validate(
        &self,
        document: &DocumentSource,
        records: &[ExtractionRecord],
        cancel: &CancelFlag,
    ) -> ValidationReport {
        let mut report = ValidationReport::default();

        for record in records.iter().filter(|record| record.is_success()) {
            if cancel.is_cancelled() {
                break;
            }

            let validation = self.validate_record(document, record, cancel);
            info!(
                strategy = %validation.strategy,
                passed = validation.passed,
                pages = validation.pages.len(),
                passed_pages = validation.passed_pages().count(),
                average_confidence = validation.average_confidence,
                fallback_attempts = validation.total_fallback_attempts,
                "strategy validated"
            );

            if !validation.passed {
                report.failed_combinations.push(FailedCombination {
                    strategy: validation.strategy.clone(),
                    average_confidence: validation.average_confidence,
                    page_pass_rate: validation.page_pass_rate(),
                    timestamp: now_utc_string(),
                });
            }
            report.strategies.push(validation);
        }

        report
    }

    pub fn validate_record(
        &self,
        document: &DocumentSource,
        record: &ExtractionRecord,
        cancel: &CancelFlag,
    ) -> StrategyValidation {
        let mut pages = Vec::with_capacity(record.pages.len());
        for page in &record.pages {
            if cancel.is_cancelled() {
                warn!(strategy = %record.strategy, "validation cancelled");
                break;
            }
            pages.push(self.validate_page(document, record, page, cancel));
        }
        StrategyValidation::from_pages(&record.strategy, pages)
    }

    /// Validates one page, searching fallback combinations when the first
    /// verdict fails. Returns the first passing attempt, or the
    /// highest-confidence failing one.
    pub fn validate_page(
        &self,
        document: &DocumentSource,
        record: &ExtractionRecord,
        page: &PageExtraction,
        cancel: &CancelFlag,
    ) -> PageValidation {
        let started = Instant::now();
        let original = page.to_record();

        let initial = self.assess(&original, &record.strategy);

        let mut best = Attempt {
            path: Vec::new(),
            verdict: initial,
            page: original.clone(),
        };
        let mut attempts = 0;

        if !best.verdict.passed {
            let plan = combination_plan(
                &best.verdict.suggestions,
                &self.fallbacks.available(),
                &self.config.fallback,
            );
            let extractor = self.tools.get(&record.strategy);

            for (index, combination) in plan.iter().enumerate() {
                let position = index + 1;
                if cancel.is_cancelled() {
                    break;
                }

                let label = strategy_label(&record.strategy, combination);
                let transformed = match self.fallbacks.apply_combination(
                    combination,
                    &original,
                    &document.path,
                    extractor,
                ) {
                    CombinationOutcome::Applied(transformed) => transformed,
                    CombinationOutcome::Skipped(reason) => {
                        debug!(strategy = %label, page = page.page_number, reason = %reason, "fallback skipped");
                        continue;
                    }
                };

                attempts += 1;
                let verdict = self.assess(&transformed, &label);
                debug!(
                    strategy = %label,
                    page = page.page_number,
                    passed = verdict.passed,
                    confidence = verdict.confidence,
                    "fallback attempt judged"
                );

                if verdict.passed {
                    best = Attempt {
                        path: combination.clone(),
                        verdict,
                        page: transformed,
                    };
                    break;
                }

                let improved = if self.config.fallback.plateau_is_no_improvement {
                    verdict.confidence > best.verdict.confidence
                } else {
                    verdict.confidence >= best.verdict.confidence
                };
                if improved {
                    best = Attempt {
                        path: combination.clone(),
                        verdict,
                        page: transformed,
                    };
                }

                if !improved && position > self.config.fallback.early_stop_after {
                    debug!(strategy = %record.strategy, page = page.page_number, position, "fallback search stopped early");
                    break;
                }
            }
        }

        let validation = PageValidation {
            page_number: page.page_number,
            strategy: record.strategy.clone(),
            passed: best.verdict.passed,
            confidence: best.verdict.confidence,
            fallback_path: best.path,
            fallback_attempts: attempts,
            processing_time_ms: elapsed_ms(started),
            notes: ValidationNotes {
                reason: best.verdict.reason,
                issues: best.verdict.issues,
                suggestions: best.verdict.suggestions,
                table_count: best.page.tables.len(),
                page_text: best.page.text,
            },
        };

        info!(
            strategy = %validation.label(),
            page = validation.page_number,
            passed = validation.passed,
            confidence = validation.confidence,
            attempts,
            "page validated"
        );
        validation
    }

    /// Pages below the minimum text length fail without a model call.
    fn assess(&self, page: &PageRecord, label: &str) -> Verdict {
        let trimmed_chars = page.text.trim().chars().count();
        if trimmed_chars < self.config.min_text_chars {
            debug!(strategy = %label, page = page.page, chars = trimmed_chars, "page below minimum text length");
            return Verdict::rejected(
                format!(
                    "extracted text has {} characters, below the minimum of {}",
                    trimmed_chars, self.config.min_text_chars
                ),
                "insufficient_text",
            );
        }
        self.judge(page, label)
    }

    fn judge(&self, page: &PageRecord, label: &str) -> Verdict {
        let prompt = validation_prompt(
            &page.text,
            page.page,
            label,
            &page.tables,
            self.config.validation_text_limit,
        );

        match self.model.complete(&prompt) {
            Ok(reply) => parse_validation_response(&reply),
            Err(err) => {
                warn!(strategy = %label, page = page.page, error = %err, "validation call failed");
                Verdict::rejected(format!("validation call failed: {}", err), err.kind())
            }
        }
    }
}

/// Orders the fallback combinations to try: tools named by the judge's
/// suggestions first, padded with the configured priority, then every
/// single tool followed by unordered pairs, capped by the search limits.
pub fn combination_plan(
    suggestions: &[String],
    available: &[FallbackKind],
    search: &FallbackSearchConfig,
) -> Vec<Vec<FallbackKind>> {
    let mut priority: Vec<FallbackKind> = Vec::new();

    for suggestion in suggestions {
        let lowered = suggestion.to_lowercase();
        for (keyword, kind) in SUGGESTION_KEYWORDS {
            if lowered.contains(keyword) && !priority.contains(&kind) {
                priority.push(kind);
                break;
            }
        }
    }

    if priority.len() < FallbackKind::ALL.len() {
        for kind in &search.priority {
            if !priority.contains(kind) && available.contains(kind) {
                priority.push(*kind);
            }
        }
    }

    let mut plan = priority
        .iter()
        .take(search.max_single_combinations)
        .filter(|kind| available.contains(kind))
        .map(|kind| vec![*kind])
        .collect::<Vec<Vec<FallbackKind>>>();

    let pool = priority
        .iter()
        .take(search.pair_pool_size)
        .filter(|kind| available.contains(kind))
        .copied()
        .collect::<Vec<FallbackKind>>();
    for (offset, first) in pool.iter().enumerate() {
        for second in &pool[offset + 1..] {
            plan.push(vec![*first, *second]);
        }
    }

    plan.truncate(search.max_combinations);
    plan
}

#[cfg(test)]
mod tests;
