use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::extract::ToolRegistry;
use crate::fallback::FallbackRegistry;
use crate::judge::Judge;
use crate::llm::ChatModel;
use crate::model::{DocumentSource, ErrorEntry, RunOutcome, Stage};
use crate::orchestrator::ExtractionOrchestrator;
use crate::selector::select;
use crate::util::{now_utc_string, panic_message, utc_compact_string, write_json_pretty};
use crate::validator::Validator;

/// Shared between a run and whoever may abandon it.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no extraction tools ran")]
    NoExtractions,
    #[error("all {0} extraction tools failed")]
    AllExtractionsFailed(usize),
    #[error("no strategy passed validation on any page, nothing to judge")]
    NoJudgments,
    #[error("run was cancelled")]
    Cancelled,
    #[error("{stage} stage panicked: {message}")]
    Panic { stage: Stage, message: String },
    #[error(transparent)]
    Stage(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoExtractions => "no_extractions",
            Self::AllExtractionsFailed(_) => "all_extractions_failed",
            Self::NoJudgments => "no_judgments",
            Self::Cancelled => "cancelled",
            Self::Panic { .. } => "panic",
            Self::Stage(_) => "stage_error",
        }
    }
}

#[derive(Serialize)]
struct RunReport<'a> {
    run_id: &'a str,
    document: &'a str,
    sha256: &'a str,
    started_at: &'a str,
    strategy: Option<&'a str>,
    total: Option<f64>,
    speed_ms_per_page: Option<f64>,
    rationale: Option<&'a str>,
    judged_strategies: usize,
    failed_combinations: usize,
    total_cost_usd: f64,
}

fn guarded<T>(stage: Stage, work: impl FnOnce() -> T) -> Result<T, PipelineError> {
    catch_unwind(AssertUnwindSafe(work)).map_err(|payload| PipelineError::Panic {
        stage,
        message: panic_message(payload.as_ref()),
    })
}

fn ensure_running(cancel: &CancelFlag) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    Ok(())
}

fn error_entry(stage: Stage, message: String, error_type: &str) -> ErrorEntry {
    ErrorEntry {
        stage,
        message,
        error_type: error_type.to_string(),
        timestamp: now_utc_string(),
    }
}

/// Runs extraction, validation, judging and reporting for one document.
pub struct Pipeline<'a> {
    config: &'a PipelineConfig,
    tools: &'a ToolRegistry,
    fallbacks: &'a FallbackRegistry,
    model: &'a dyn ChatModel,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        tools: &'a ToolRegistry,
        fallbacks: &'a FallbackRegistry,
        model: &'a dyn ChatModel,
    ) -> Self {
        Self {
            config,
            tools,
            fallbacks,
            model,
        }
    }

    /// Stage failures end the run in `Stage::Failed` with the cause as the
    /// last error log entry. Only cancellation is returned as an error; a
    /// cancelled run's partial results are dropped.
    pub fn run(&self, document: &DocumentSource, cancel: &CancelFlag) -> Result<RunOutcome, PipelineError> {
        let mut rng = match self.config.sample_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let short_sha = document.sha256.get(..12).unwrap_or(&document.sha256);
        let run_id = format!(
            "{}-{}-{:04x}",
            utc_compact_string(Utc::now()),
            short_sha,
            rng.random::<u16>()
        );

        let mut run = RunOutcome {
            run_id,
            document: document.name.clone(),
            sha256: document.sha256.clone(),
            stage: Stage::Extraction,
            started_at: now_utc_string(),
            finished_at: String::new(),
            extractions: Vec::new(),
            validations: Vec::new(),
            judgments: Vec::new(),
            selection: None,
            failed_combinations: Vec::new(),
            error_log: Vec::new(),
        };
        info!(run_id = %run.run_id, document = %run.document, tools = self.tools.len(), "pipeline started");

        match self.advance(document, &mut run, &mut rng, cancel) {
            Ok(()) => {
                run.stage = Stage::Completed;
                info!(
                    run_id = %run.run_id,
                    strategy = run.selection.as_ref().map(|selection| selection.strategy.as_str()).unwrap_or("none"),
                    cost_usd = run.total_cost_usd(),
                    "pipeline completed"
                );
            }
            Err(PipelineError::Cancelled) => {
                warn!(run_id = %run.run_id, stage = %run.stage, "pipeline cancelled, discarding results");
                return Err(PipelineError::Cancelled);
            }
            Err(err) => {
                let stage = match &err {
                    PipelineError::Panic { stage, .. } => *stage,
                    _ => run.stage,
                };
                error!(run_id = %run.run_id, stage = %stage, error = %format!("{err:#}"), "pipeline failed");
                run.error_log.push(error_entry(stage, format!("{err:#}"), err.kind()));
                run.selection = None;
                run.stage = Stage::Failed;
            }
        }

        run.finished_at = now_utc_string();
        Ok(run)
    }

    fn advance(
        &self,
        document: &DocumentSource,
        run: &mut RunOutcome,
        rng: &mut StdRng,
        cancel: &CancelFlag,
    ) -> Result<(), PipelineError> {
        run.stage = Stage::Extraction;
        let orchestrator = ExtractionOrchestrator::new(self.tools, self.config);
        run.extractions = guarded(Stage::Extraction, || orchestrator.extract_all(document, rng, cancel))?;
        ensure_running(cancel)?;

        for record in run.extractions.iter().filter(|record| !record.is_success()) {
            run.error_log.push(error_entry(
                Stage::Extraction,
                format!(
                    "{}: {}",
                    record.strategy,
                    record.error_message.as_deref().unwrap_or("extraction failed")
                ),
                "tool_failure",
            ));
        }
        if run.extractions.is_empty() {
            return Err(PipelineError::NoExtractions);
        }
        if !run.extractions.iter().any(|record| record.is_success()) {
            return Err(PipelineError::AllExtractionsFailed(run.extractions.len()));
        }

        run.stage = Stage::Validation;
        let validator = Validator::new(self.model, self.fallbacks, self.tools, self.config);
        let report = guarded(Stage::Validation, || validator.validate(document, &run.extractions, cancel))?;
        ensure_running(cancel)?;
        run.validations = report.strategies;
        run.failed_combinations = report.failed_combinations;

        run.stage = Stage::Judge;
        let judge = Judge::new(self.model, self.config);
        run.judgments = guarded(Stage::Judge, || {
            judge.judge(document, &run.validations, &run.extractions, cancel)
        })?;
        ensure_running(cancel)?;
        if run.judgments.is_empty() {
            return Err(PipelineError::NoJudgments);
        }
        run.selection = guarded(Stage::Judge, || {
            select(&document.name, &run.judgments, &self.config.selection)
        })?;
        if run.selection.is_none() {
            return Err(PipelineError::NoJudgments);
        }

        run.stage = Stage::Report;
        match self.write_report(document, run) {
            Ok(Some(path)) => info!(path = %path.display(), "run report written"),
            Ok(None) => {}
            Err(err) => {
                warn!(run_id = %run.run_id, error = %format!("{err:#}"), "failed to write run report");
                run.error_log.push(error_entry(Stage::Report, format!("{err:#}"), "report_write"));
            }
        }
        Ok(())
    }

    fn write_report(&self, document: &DocumentSource, run: &RunOutcome) -> anyhow::Result<Option<PathBuf>> {
        if !self.config.save_intermediate {
            return Ok(None);
        }

        let selection = run.selection.as_ref();
        let report = RunReport {
            run_id: &run.run_id,
            document: &run.document,
            sha256: &run.sha256,
            started_at: &run.started_at,
            strategy: selection.map(|selection| selection.strategy.as_str()),
            total: selection.map(|selection| selection.total),
            speed_ms_per_page: selection.map(|selection| selection.speed_ms_per_page),
            rationale: selection.map(|selection| selection.rationale.as_str()),
            judged_strategies: run.judgments.len(),
            failed_combinations: run.failed_combinations.len(),
            total_cost_usd: run.total_cost_usd(),
        };

        let path = self
            .config
            .workspace_root
            .join("reports")
            .join(&document.stem)
            .join(format!("{}.json", run.run_id));
        write_json_pretty(&path, &report)?;
        Ok(Some(path))
    }
}
