use std::io::{self, Write};

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::cli::EvaluateArgs;
use crate::commands::{db_path, log_outcome, pipeline_config, require_api_key};
use crate::extract::ToolRegistry;
use crate::fallback::FallbackRegistry;
use crate::llm::SolarClient;
use crate::model::DocumentSource;
use crate::pipeline::{CancelFlag, Pipeline};
use crate::store::RunStore;

pub fn run(args: EvaluateArgs) -> Result<()> {
    let config = pipeline_config(&args.run);
    require_api_key(&config)?;

    let document = DocumentSource::open(&args.input)?;
    let tools = ToolRegistry::standard(&config)?;
    if tools.is_empty() {
        bail!("no extraction tools enabled");
    }
    let fallbacks = FallbackRegistry::standard();
    let model = SolarClient::new(&config).context("failed to build judge client")?;

    info!(
        document = %document.name,
        sha256 = %document.sha256,
        tools = tools.len(),
        max_samples = config.max_sampled_pages,
        "evaluation started"
    );

    let outcome = Pipeline::new(&config, &tools, &fallbacks, &model)
        .run(&document, &CancelFlag::new())
        .with_context(|| format!("evaluation of {} did not finish", document.name))?;

    let db_path = db_path(&args.run.workspace, args.run.db_path.as_ref());
    let mut store = RunStore::open(&db_path)?;
    store.persist(&outcome)?;
    info!(run_id = %outcome.run_id, path = %db_path.display(), "run stored");

    log_outcome(&outcome);

    if args.json {
        let mut output = io::BufWriter::new(io::stdout().lock());
        serde_json::to_writer_pretty(&mut output, &outcome)
            .context("failed to serialize run outcome")?;
        writeln!(output)?;
        output.flush()?;
    }

    if let Some(reason) = outcome.failure_reason() {
        bail!(
            "evaluation of {} failed at the {} stage: {}",
            outcome.document,
            reason.stage,
            reason.message
        );
    }
    Ok(())
}
