use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::{info, warn};

use crate::cli::RunArgs;
use crate::config::{API_KEY_ENV, PipelineConfig};
use crate::model::RunOutcome;

pub mod batch;
pub mod evaluate;
pub mod status;

const DB_FILE_NAME: &str = "docbench.sqlite";

pub(crate) fn db_path(workspace: &Path, db_path: Option<&PathBuf>) -> PathBuf {
    db_path
        .cloned()
        .unwrap_or_else(|| workspace.join(DB_FILE_NAME))
}

pub(crate) fn pipeline_config(args: &RunArgs) -> PipelineConfig {
    let mut config = PipelineConfig::from_env();

    if let Some(api_key) = args.api_key.as_ref().map(|key| key.trim()).filter(|key| !key.is_empty()) {
        config.api_key = Some(api_key.to_string());
    }
    if let Some(api_base) = &args.api_base {
        config.api_base = api_base.clone();
    }
    if let Some(model) = &args.model {
        config.model = model.clone();
    }
    if !args.tools.is_empty() {
        config.enabled_tools = args.tools.clone();
    }

    config.workspace_root = args.workspace.clone();
    config.save_intermediate = !args.no_artifacts;
    config.max_sampled_pages = args.max_samples.max(1);
    config.sample_seed = args.seed;
    config.llm_timeout = Duration::from_secs(args.llm_timeout_secs);
    config.ocr_timeout = Duration::from_secs(args.ocr_timeout_secs);
    config.fallback.early_stop_after = args.early_stop_after;
    config.fallback.plateau_is_no_improvement = !args.plateau_counts_as_progress;
    config
}

pub(crate) fn require_api_key(config: &PipelineConfig) -> Result<()> {
    if config.api_key.is_none() {
        bail!(
            "no API key for the judge model: set {} or pass --api-key",
            API_KEY_ENV
        );
    }
    Ok(())
}

pub(crate) fn log_outcome(outcome: &RunOutcome) {
    for validation in &outcome.validations {
        info!(
            document = %outcome.document,
            strategy = %validation.strategy,
            passed = validation.passed,
            page_pass_rate = validation.page_pass_rate(),
            average_confidence = validation.average_confidence,
            "validation summary"
        );
    }
    for judgment in &outcome.judgments {
        info!(
            document = %outcome.document,
            strategy = %judgment.strategy,
            total = judgment.total,
            grade = %judgment.grade,
            speed_ms_per_page = judgment.speed_ms_per_page,
            "judgment summary"
        );
    }

    match (&outcome.selection, outcome.failure_reason()) {
        (Some(selection), _) => info!(
            document = %outcome.document,
            run_id = %outcome.run_id,
            strategy = %selection.strategy,
            total = selection.total,
            rationale = %selection.rationale,
            cost_usd = outcome.total_cost_usd(),
            "selected extraction strategy"
        ),
        (None, Some(reason)) => warn!(
            document = %outcome.document,
            run_id = %outcome.run_id,
            stage = %reason.stage,
            error_type = %reason.error_type,
            reason = %reason.message,
            "no strategy selected"
        ),
        (None, None) => warn!(document = %outcome.document, run_id = %outcome.run_id, "no strategy selected"),
    }
}
