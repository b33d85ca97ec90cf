use tracing::{info, warn};

use crate::config::{GradeThresholds, JudgeWeights, PipelineConfig};
use crate::llm::ChatModel;
use crate::model::{
    AxisScores, DocumentSource, ExtractionRecord, Grade, PageJudgment, PageValidation,
    StrategyJudgment, StrategyValidation,
};
use crate::pipeline::CancelFlag;

mod prompt;

pub use prompt::{QualityScores, parse_quality_response, quality_prompt};

pub fn weighted_total(scores: &AxisScores, weights: &JudgeWeights) -> f64 {
    scores.read * weights.read
        + scores.sentence * weights.sentence
        + scores.noise * weights.noise
        + scores.table * weights.table
        + scores.figure * weights.figure
}

pub fn grade_for(total: f64, thresholds: &GradeThresholds) -> Grade {
    if total >= thresholds.pass {
        Grade::Pass
    } else if total >= thresholds.borderline {
        Grade::Borderline
    } else {
        Grade::Fail
    }
}

fn mean_scores(pages: &[PageJudgment]) -> AxisScores {
    let count = pages.len().max(1) as f64;
    let mut sum = AxisScores::default();
    for page in pages {
        sum.read += page.scores.read;
        sum.sentence += page.scores.sentence;
        sum.noise += page.scores.noise;
        sum.table += page.scores.table;
        sum.figure += page.scores.figure;
    }
    AxisScores {
        read: sum.read / count,
        sentence: sum.sentence / count,
        noise: sum.noise / count,
        table: sum.table / count,
        figure: sum.figure / count,
    }
}

/// Scores validated pages on five axes and rolls them up per strategy.
pub struct Judge<'a> {
    model: &'a dyn ChatModel,
    config: &'a PipelineConfig,
}

impl<'a> Judge<'a> {
    pub fn new(model: &'a dyn ChatModel, config: &'a PipelineConfig) -> Self {
        Self { model, config }
    }

    /// Judges every strategy with at least one passing page. Only the passing
    /// pages are scored; strategies without any are left out entirely.
    pub fn judge(
        &self,
        document: &DocumentSource,
        validations: &[StrategyValidation],
        records: &[ExtractionRecord],
        cancel: &CancelFlag,
    ) -> Vec<StrategyJudgment> {
        let mut judgments = Vec::new();

        for validation in validations {
            if cancel.is_cancelled() {
                break;
            }
            if validation.passed_pages().next().is_none() {
                info!(strategy = %validation.strategy, "no passing pages, strategy not judged");
                continue;
            }

            let mut pages = Vec::new();
            for page in validation.passed_pages() {
                if cancel.is_cancelled() {
                    break;
                }
                pages.push(self.judge_page(document, page));
            }
            if pages.is_empty() {
                continue;
            }

            let extraction_ms = records
                .iter()
                .find(|record| record.strategy == validation.strategy)
                .map(|record| record.processing_time_ms)
                .unwrap_or(0.0);
            let judgment = self.aggregate(validation, pages, extraction_ms);
            info!(
                strategy = %judgment.strategy,
                total = judgment.total,
                grade = %judgment.grade,
                pages = judgment.pages.len(),
                speed_ms_per_page = judgment.speed_ms_per_page,
                "strategy judged"
            );
            judgments.push(judgment);
        }

        judgments
    }

    pub fn judge_page(&self, document: &DocumentSource, page: &PageValidation) -> PageJudgment {
        let label = page.label();
        let prompt = quality_prompt(
            &document.name,
            &label,
            page.page_number,
            &page.notes.page_text,
            page.notes.table_count,
            self.config.judge_text_limit,
        );

        let quality = match self.model.complete(&prompt) {
            Ok(reply) => parse_quality_response(&reply, &self.config.judge_defaults),
            Err(err) => {
                warn!(strategy = %label, page = page.page_number, error = %err, "quality call failed");
                QualityScores::defaults(
                    &self.config.judge_defaults,
                    format!("quality call failed ({}); default scores applied", err.kind()),
                )
            }
        };

        let total = weighted_total(&quality.scores, &self.config.judge_weights);
        PageJudgment {
            page_number: page.page_number,
            strategy: label,
            scores: quality.scores,
            total,
            grade: grade_for(total, &self.config.grade_thresholds),
            rationale: quality.rationale,
            comments: quality.comments,
        }
    }

    fn aggregate(
        &self,
        validation: &StrategyValidation,
        pages: Vec<PageJudgment>,
        extraction_ms: f64,
    ) -> StrategyJudgment {
        let total = pages.iter().map(|page| page.total).sum::<f64>() / pages.len().max(1) as f64;
        let validation_ms = validation
            .pages
            .iter()
            .map(|page| page.processing_time_ms)
            .sum::<f64>();
        let speed_ms_per_page = (extraction_ms + validation_ms) / validation.pages.len().max(1) as f64;

        StrategyJudgment {
            strategy: validation.strategy.clone(),
            scores: mean_scores(&pages),
            total,
            grade: grade_for(total, &self.config.grade_thresholds),
            speed_ms_per_page,
            fallback_tools: validation.fallback_tools.clone(),
            pages,
        }
    }
}

#[cfg(test)]
mod tests;
