use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;

use crate::model::{DocumentSource, ExtractionRecord, TableGrid, TextFragment};
use crate::util::{now_utc_string, write_json_lines, write_json_pretty};

pub const SAMPLED_PAGES_FILE: &str = "pages_text_sampled.jsonl";
pub const DOC_META_FILE: &str = "doc_meta.json";

#[derive(Debug, Serialize)]
struct SampledPageRow<'a> {
    page: u32,
    source: &'a str,
    text: &'a str,
    bbox: &'a [TextFragment],
    tables: &'a [TableGrid],
}

#[derive(Debug, Serialize)]
struct DocMeta<'a> {
    document: &'a str,
    sha256: &'a str,
    engine: &'a str,
    version: &'a str,
    settings: &'a BTreeMap<String, serde_json::Value>,
    total_pages: usize,
    sampled_pages_count: usize,
    sampled_pages: &'a [u32],
    processing_time_ms: f64,
    cost_usd: f64,
    extracted_at: String,
}

/// Per-tool intermediate artifacts under
/// `<root>/extracted/<doc_stem>/<tool>/`.
#[derive(Debug, Clone)]
pub struct ExtractionWorkspace {
    root: PathBuf,
    enabled: bool,
}

impl ExtractionWorkspace {
    pub fn new(root: &Path, enabled: bool) -> Self {
        Self {
            root: root.to_path_buf(),
            enabled,
        }
    }

    pub fn tool_dir(&self, document: &DocumentSource, tool: &str) -> PathBuf {
        self.root.join("extracted").join(&document.stem).join(tool)
    }

    pub fn save(&self, document: &DocumentSource, record: &ExtractionRecord) -> Result<Option<PathBuf>> {
        if !self.enabled || !record.is_success() {
            return Ok(None);
        }

        let dir = self.tool_dir(document, &record.strategy);
        let rows = record
            .pages
            .iter()
            .map(|page| SampledPageRow {
                page: page.page_number,
                source: &record.strategy,
                text: &page.text,
                bbox: &page.bbox,
                tables: &page.tables,
            })
            .collect::<Vec<SampledPageRow<'_>>>();
        write_json_lines(&dir.join(SAMPLED_PAGES_FILE), &rows)?;

        let meta = DocMeta {
            document: &document.name,
            sha256: &document.sha256,
            engine: &record.strategy,
            version: &record.tool_version,
            settings: &record.settings,
            total_pages: record.total_page_count,
            sampled_pages_count: record.sampled_page_count,
            sampled_pages: &record.sampled_pages,
            processing_time_ms: record.processing_time_ms,
            cost_usd: record.cost_usd,
            extracted_at: now_utc_string(),
        };
        write_json_pretty(&dir.join(DOC_META_FILE), &meta)?;

        Ok(Some(dir))
    }
}
