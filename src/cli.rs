use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "docbench",
    version,
    about = "Benchmark PDF text extraction strategies and pick the best one per document"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Evaluate(EvaluateArgs),
    Batch(BatchArgs),
    Status(StatusArgs),
}

/// Settings shared by every command that runs the pipeline.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(long, default_value = ".cache/docbench")]
    pub workspace: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long, default_value_t = 5)]
    pub max_samples: usize,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Restrict extraction to these tools (repeatable).
    #[arg(long = "tool")]
    pub tools: Vec<String>,

    /// Overrides the SOLAR_API_KEY environment variable.
    #[arg(long)]
    pub api_key: Option<String>,

    #[arg(long)]
    pub api_base: Option<String>,

    #[arg(long)]
    pub model: Option<String>,

    #[arg(long, default_value_t = 120)]
    pub llm_timeout_secs: u64,

    #[arg(long, default_value_t = 300)]
    pub ocr_timeout_secs: u64,

    #[arg(long, default_value_t = 2)]
    pub early_stop_after: usize,

    /// Treat an equal confidence as progress during the fallback search.
    #[arg(long, default_value_t = false)]
    pub plateau_counts_as_progress: bool,

    #[arg(long, default_value_t = false)]
    pub no_artifacts: bool,
}

#[derive(Args, Debug, Clone)]
pub struct EvaluateArgs {
    #[arg(long)]
    pub input: PathBuf,

    #[command(flatten)]
    pub run: RunArgs,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct BatchArgs {
    #[arg(long)]
    pub input_dir: PathBuf,

    #[command(flatten)]
    pub run: RunArgs,

    #[arg(long, default_value_t = 2)]
    pub workers: usize,

    #[arg(long, default_value_t = 8)]
    pub queue_capacity: usize,

    /// Cancel documents still running after this many seconds.
    #[arg(long)]
    pub deadline_secs: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/docbench")]
    pub workspace: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long, default_value_t = 10)]
    pub recent: usize,
}
