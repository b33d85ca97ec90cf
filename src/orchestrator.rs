use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Instant;

use rand::Rng;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::extract::{ExtractionTool, ToolRegistry, normalize_extraction};
use crate::model::{DocumentSource, ExtractionRecord, PageExtraction, RecordStatus};
use crate::pipeline::CancelFlag;
use crate::sampler::sample_page_numbers;
use crate::util::{elapsed_ms, panic_message};
use crate::workspace::ExtractionWorkspace;

pub struct ExtractionOrchestrator<'a> {
    tools: &'a ToolRegistry,
    config: &'a PipelineConfig,
    workspace: ExtractionWorkspace,
}

impl<'a> ExtractionOrchestrator<'a> {
    pub fn new(tools: &'a ToolRegistry, config: &'a PipelineConfig) -> Self {
        Self {
            tools,
            config,
            workspace: ExtractionWorkspace::new(&config.workspace_root, config.save_intermediate),
        }
    }

    /// Runs every registered tool in order. A tool that errors or panics
    /// yields a failed record and the loop moves on; cancellation stops the
    /// loop and returns what was gathered so far.
    pub fn extract_all<R: Rng + ?Sized>(
        &self,
        document: &DocumentSource,
        rng: &mut R,
        cancel: &CancelFlag,
    ) -> Vec<ExtractionRecord> {
        let mut records = Vec::with_capacity(self.tools.len());

        for tool in self.tools.iter() {
            if cancel.is_cancelled() {
                warn!(document = %document.name, "extraction cancelled");
                break;
            }

            let record = self.extract_one(tool, document, rng);
            if record.is_success() {
                if let Err(err) = self.workspace.save(document, &record) {
                    warn!(tool = %record.strategy, error = %err, "failed to write extraction artifacts");
                }
            }
            records.push(record);
        }

        records
    }

    pub fn extract_one<R: Rng + ?Sized>(
        &self,
        tool: &dyn ExtractionTool,
        document: &DocumentSource,
        rng: &mut R,
    ) -> ExtractionRecord {
        let name = tool.name();
        let version = tool.version();
        info!(tool = %name, version = %version, document = %document.name, "running extraction tool");

        let started = Instant::now();
        let outcome = match catch_unwind(AssertUnwindSafe(|| tool.extract(&document.path))) {
            Ok(result) => result.and_then(|raw| normalize_extraction(name, raw)),
            Err(payload) => Err(anyhow::anyhow!("{} panicked: {}", name, panic_message(payload.as_ref()))),
        };
        let elapsed = elapsed_ms(started);

        let raw = match outcome {
            Ok(raw) if raw.pages.is_empty() => {
                warn!(tool = %name, "extraction produced no pages");
                return ExtractionRecord::failed(name, version, format!("{} produced no pages", name), elapsed);
            }
            Ok(raw) => raw,
            Err(err) => {
                warn!(tool = %name, error = %format!("{err:#}"), "extraction tool failed");
                return ExtractionRecord::failed(name, version, format!("{err:#}"), elapsed);
            }
        };

        let total_page_count = raw.pages.len();
        let available = raw.pages.iter().map(|page| page.page).collect::<Vec<u32>>();
        let sampled_pages = sample_page_numbers(&available, self.config.max_sampled_pages, rng);
        let sampled_page_count = sampled_pages.len();
        let per_page_ms = elapsed / sampled_page_count.max(1) as f64;

        let pages = raw
            .pages
            .into_iter()
            .filter(|page| sampled_pages.contains(&page.page))
            .map(|page| PageExtraction::from_record(name, page, per_page_ms))
            .collect::<Vec<PageExtraction>>();
        let cost_usd = self.config.cost_for(name) * sampled_page_count as f64;

        info!(
            tool = %name,
            total_pages = total_page_count,
            sampled = ?sampled_pages,
            elapsed_ms = elapsed,
            cost_usd,
            "extraction complete"
        );

        ExtractionRecord {
            strategy: name.to_string(),
            tool_version: version,
            sampled_pages,
            pages,
            total_page_count,
            sampled_page_count,
            processing_time_ms: elapsed,
            cost_usd,
            status: RecordStatus::Success,
            error_message: None,
            settings: raw.settings,
        }
    }
}
