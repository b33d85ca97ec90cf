use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use tracing::{debug, info, warn};

use crate::cli::BatchArgs;
use crate::commands::{db_path, log_outcome, pipeline_config, require_api_key};
use crate::config::PipelineConfig;
use crate::extract::ToolRegistry;
use crate::fallback::FallbackRegistry;
use crate::llm::{ChatModel, SolarClient};
use crate::model::{DocumentSource, RunOutcome, Stage};
use crate::pipeline::{CancelFlag, Pipeline, PipelineError};
use crate::store::RunStore;

/// The pipeline collaborators one worker owns for its whole lifetime.
pub struct WorkerKit {
    pub tools: ToolRegistry,
    pub fallbacks: FallbackRegistry,
    pub model: Box<dyn ChatModel>,
}

#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    pub workers: usize,
    pub queue_capacity: usize,
    pub deadline: Option<Duration>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub errored: usize,
}

enum WorkerMessage {
    Finished(Box<RunOutcome>),
    Cancelled(PathBuf),
    Error { path: PathBuf, message: String },
}

pub fn run(args: BatchArgs) -> Result<()> {
    let config = pipeline_config(&args.run);
    require_api_key(&config)?;

    let inputs = discover_pdfs(&args.input_dir)?;
    if inputs.is_empty() {
        warn!(input_dir = %args.input_dir.display(), "no PDF files found");
        return Ok(());
    }

    let db_path = db_path(&args.run.workspace, args.run.db_path.as_ref());
    let mut store = RunStore::open(&db_path)?;
    let options = PoolOptions {
        workers: args.workers,
        queue_capacity: args.queue_capacity,
        deadline: args.deadline_secs.map(Duration::from_secs),
    };
    info!(
        documents = inputs.len(),
        workers = options.workers,
        queue_capacity = options.queue_capacity,
        "batch started"
    );

    let total = inputs.len();
    let mut persist = |outcome: &RunOutcome| -> Result<()> { store.persist(outcome) };
    let summary = run_pool(inputs, options, &config, standard_kit, &mut persist);

    info!(
        documents = total,
        completed = summary.completed,
        failed = summary.failed,
        cancelled = summary.cancelled,
        errored = summary.errored,
        db_path = %db_path.display(),
        "batch finished"
    );

    if summary.completed == 0 && summary.failed == 0 {
        bail!("no document in {} produced a run", args.input_dir.display());
    }
    Ok(())
}

fn standard_kit(config: &PipelineConfig) -> Result<WorkerKit> {
    Ok(WorkerKit {
        tools: ToolRegistry::standard(config)?,
        fallbacks: FallbackRegistry::standard(),
        model: Box::new(SolarClient::new(config).context("failed to build judge client")?),
    })
}

pub fn discover_pdfs(input_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(input_dir)
        .with_context(|| format!("failed to read input directory {}", input_dir.display()))?;

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("failed to list {}", input_dir.display()))?
            .path();
        let is_pdf = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
        if is_pdf && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Feeds documents through a bounded queue to `options.workers` threads.
/// Outcomes come back to the calling thread, which hands every completed or
/// failed run to `sink`; cancelled runs are dropped. Past the deadline the
/// shared cancel flag is raised and the remaining documents drain as
/// cancelled.
pub fn run_pool<F>(
    inputs: Vec<PathBuf>,
    options: PoolOptions,
    config: &PipelineConfig,
    make_kit: F,
    sink: &mut dyn FnMut(&RunOutcome) -> Result<()>,
) -> BatchSummary
where
    F: Fn(&PipelineConfig) -> Result<WorkerKit> + Sync,
{
    let mut summary = BatchSummary::default();
    if inputs.is_empty() {
        return summary;
    }

    let cancel = CancelFlag::new();
    let capacity = options.queue_capacity.max(1);
    let (task_tx, task_rx) = bounded::<PathBuf>(capacity);
    let (result_tx, result_rx) = bounded::<WorkerMessage>(capacity);
    let workers = options.workers.clamp(1, inputs.len());
    let mut deadline = options.deadline.map(|limit| Instant::now() + limit);

    thread::scope(|scope| {
        for worker_id in 0..workers {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let cancel = cancel.clone();
            let make_kit = &make_kit;
            scope.spawn(move || worker_loop(worker_id, config, make_kit, task_rx, result_tx, cancel));
        }
        drop(task_rx);
        drop(result_tx);

        scope.spawn(move || {
            for path in inputs {
                if task_tx.send(path).is_err() {
                    break;
                }
            }
        });

        loop {
            let received = match deadline {
                Some(at) => match result_rx.recv_deadline(at) {
                    Ok(message) => Some(message),
                    Err(RecvTimeoutError::Timeout) => {
                        warn!("batch deadline reached, cancelling remaining documents");
                        cancel.cancel();
                        deadline = None;
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => None,
                },
                None => result_rx.recv().ok(),
            };
            let Some(message) = received else {
                break;
            };

            match message {
                WorkerMessage::Finished(outcome) => {
                    if outcome.stage == Stage::Failed {
                        summary.failed += 1;
                    } else {
                        summary.completed += 1;
                    }
                    log_outcome(&outcome);
                    if let Err(err) = sink(&outcome) {
                        warn!(run_id = %outcome.run_id, error = %format!("{err:#}"), "failed to store run");
                    }
                }
                WorkerMessage::Cancelled(path) => {
                    summary.cancelled += 1;
                    info!(path = %path.display(), "document cancelled");
                }
                WorkerMessage::Error { path, message } => {
                    summary.errored += 1;
                    warn!(path = %path.display(), error = %message, "document skipped");
                }
            }
        }
    });

    summary
}

fn worker_loop<F>(
    worker_id: usize,
    config: &PipelineConfig,
    make_kit: &F,
    tasks: Receiver<PathBuf>,
    results: Sender<WorkerMessage>,
    cancel: CancelFlag,
) where
    F: Fn(&PipelineConfig) -> Result<WorkerKit>,
{
    let kit = match make_kit(config) {
        Ok(kit) => kit,
        Err(err) => {
            let message = format!("worker setup failed: {err:#}");
            warn!(worker_id, error = %message, "batch worker unavailable");
            for path in tasks.iter() {
                let failure = WorkerMessage::Error {
                    path,
                    message: message.clone(),
                };
                if results.send(failure).is_err() {
                    break;
                }
            }
            return;
        }
    };
    let pipeline = Pipeline::new(config, &kit.tools, &kit.fallbacks, kit.model.as_ref());

    for path in tasks.iter() {
        debug!(worker_id, path = %path.display(), "worker picked up document");
        let message = if cancel.is_cancelled() {
            WorkerMessage::Cancelled(path)
        } else {
            process_document(&pipeline, path, &cancel)
        };
        if results.send(message).is_err() {
            break;
        }
    }
}

fn process_document(pipeline: &Pipeline<'_>, path: PathBuf, cancel: &CancelFlag) -> WorkerMessage {
    let document = match DocumentSource::open(&path) {
        Ok(document) => document,
        Err(err) => {
            return WorkerMessage::Error {
                path,
                message: format!("{err:#}"),
            };
        }
    };

    match pipeline.run(&document, cancel) {
        Ok(outcome) => WorkerMessage::Finished(Box::new(outcome)),
        Err(PipelineError::Cancelled) => WorkerMessage::Cancelled(path),
        Err(err) => WorkerMessage::Error {
            path,
            message: format!("{err:#}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FnModel, StaticTool, scores_reply, verdict_reply};

    const BODY: &str = "Quarterly revenue rose on the back of steady loan growth.";

    fn kit(_config: &PipelineConfig) -> Result<WorkerKit> {
        Ok(WorkerKit {
            tools: ToolRegistry::new(vec![Box::new(StaticTool {
                name: "static",
                texts: vec![BODY.to_string(); 2],
            })]),
            fallbacks: FallbackRegistry::empty(),
            model: Box::new(FnModel::new(|prompt: &str| {
                if prompt.contains("S_read") {
                    scores_reply(92.0)
                } else {
                    verdict_reply(true, 0.9)
                }
            })),
        })
    }

    fn write_documents(dir: &Path, names: &[&str]) -> Vec<PathBuf> {
        names
            .iter()
            .map(|name| {
                let path = dir.join(name);
                fs::write(&path, format!("%PDF-1.4 {name}")).unwrap();
                path
            })
            .collect()
    }

    fn config(root: &Path) -> PipelineConfig {
        PipelineConfig {
            workspace_root: root.to_path_buf(),
            save_intermediate: false,
            sample_seed: Some(3),
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn discovers_only_pdf_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_documents(dir.path(), &["b.pdf", "a.PDF", "notes.txt"]);
        fs::create_dir(dir.path().join("nested.pdf")).unwrap();

        let found = discover_pdfs(dir.path()).unwrap();
        let names = found
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().to_string())
            .collect::<Vec<String>>();
        assert_eq!(names, vec!["a.PDF".to_string(), "b.pdf".to_string()]);
    }

    #[test]
    fn every_document_reaches_the_sink() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = write_documents(dir.path(), &["a.pdf", "b.pdf", "c.pdf"]);
        let config = config(dir.path());
        let options = PoolOptions {
            workers: 2,
            queue_capacity: 1,
            deadline: None,
        };

        let mut selected = Vec::new();
        let mut sink = |outcome: &RunOutcome| -> Result<()> {
            selected.push((outcome.document.clone(), outcome.selection.as_ref().map(|s| s.strategy.clone())));
            Ok(())
        };
        let summary = run_pool(inputs, options, &config, kit, &mut sink);

        assert_eq!(
            summary,
            BatchSummary {
                completed: 3,
                ..BatchSummary::default()
            }
        );
        selected.sort();
        assert_eq!(
            selected,
            vec![
                ("a.pdf".to_string(), Some("static".to_string())),
                ("b.pdf".to_string(), Some("static".to_string())),
                ("c.pdf".to_string(), Some("static".to_string())),
            ]
        );
    }

    #[test]
    fn missing_documents_are_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut inputs = write_documents(dir.path(), &["a.pdf"]);
        inputs.push(dir.path().join("gone.pdf"));
        let config = config(dir.path());
        let options = PoolOptions {
            workers: 1,
            queue_capacity: 4,
            deadline: None,
        };

        let mut stored = 0;
        let mut sink = |_: &RunOutcome| -> Result<()> {
            stored += 1;
            Ok(())
        };
        let summary = run_pool(inputs, options, &config, kit, &mut sink);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.errored, 1);
        assert_eq!(stored, 1);
    }

    #[test]
    fn worker_setup_failure_marks_documents_errored() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = write_documents(dir.path(), &["a.pdf", "b.pdf"]);
        let config = config(dir.path());
        let options = PoolOptions {
            workers: 2,
            queue_capacity: 2,
            deadline: None,
        };

        let mut sink = |_: &RunOutcome| -> Result<()> { Ok(()) };
        let summary = run_pool(
            inputs,
            options,
            &config,
            |_: &PipelineConfig| -> Result<WorkerKit> { bail!("judge unreachable") },
            &mut sink,
        );
        assert_eq!(summary.errored, 2);
        assert_eq!(summary.completed, 0);
    }

    #[test]
    fn expired_deadline_accounts_for_every_document() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = write_documents(dir.path(), &["a.pdf", "b.pdf", "c.pdf", "d.pdf"]);
        let config = config(dir.path());
        let options = PoolOptions {
            workers: 2,
            queue_capacity: 1,
            deadline: Some(Duration::ZERO),
        };

        let mut sink = |_: &RunOutcome| -> Result<()> { Ok(()) };
        let summary = run_pool(inputs, options, &config, kit, &mut sink);
        assert_eq!(summary.completed + summary.cancelled, 4);
        assert_eq!(summary.errored, 0);
    }
}
