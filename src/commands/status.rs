use anyhow::Result;
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::commands::db_path;
use crate::config::{PipelineConfig, TOOL_PDFTOHTML, TOOL_PDFTOTEXT};
use crate::extract::command_version_optional;
use crate::store::RunStore;

pub fn run(args: StatusArgs) -> Result<()> {
    let config = PipelineConfig::from_env();
    info!(workspace = %args.workspace.display(), "status requested");

    for program in [TOOL_PDFTOTEXT, TOOL_PDFTOHTML] {
        match command_version_optional(program, &["-v"]) {
            Some(version) => info!(program, version = %version, "poppler binary available"),
            None => warn!(program, "poppler binary missing"),
        }
    }

    for tool in &config.enabled_tools {
        let cost_per_page = config.cost_for(tool);
        info!(tool = %tool, cost_per_page, metered = cost_per_page > 0.0, "extraction tool enabled");
    }

    if config.api_key.is_some() {
        info!(api_base = %config.api_base, model = %config.model, "judge and remote OCR credentials present");
    } else {
        warn!("no API key set, the judge model and remote OCR tools are unavailable");
    }

    let db_path = db_path(&args.workspace, args.db_path.as_ref());
    if !db_path.exists() {
        warn!(path = %db_path.display(), "run database missing");
        return Ok(());
    }

    let store = RunStore::open(&db_path)?;
    let counts = store.counts()?;
    info!(
        path = %db_path.display(),
        runs = counts.runs,
        completed = counts.completed,
        failed = counts.failed,
        extractions = counts.extractions,
        page_validations = counts.page_validations,
        judgments = counts.judgments,
        errors = counts.errors,
        "database status"
    );

    for run in store.recent_runs(args.recent)? {
        info!(
            run_id = %run.run_id,
            document = %run.document,
            stage = %run.stage,
            strategy = %run.selected_strategy.as_deref().unwrap_or("-"),
            total = run.selected_total.unwrap_or(0.0),
            finished_at = %run.finished_at,
            "recent run"
        );
    }

    Ok(())
}
