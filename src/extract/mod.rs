use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Result, bail};
use tracing::warn;

use crate::config::{PipelineConfig, STANDARD_TOOL_ORDER};
use crate::model::{PageRecord, RawExtraction, TableGrid};

mod poppler;
mod tables;
mod upstage;

pub use poppler::{
    PdftohtmlTool, PdftotextBboxTool, PdftotextLayoutTool, command_version_optional,
};
pub use upstage::{UpstageDocumentParseTool, UpstageOcrTool};

/// A text-extraction engine that turns a whole PDF into page records.
pub trait ExtractionTool: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> String;

    fn extract(&self, source: &Path) -> Result<RawExtraction>;
}

pub struct ToolRegistry {
    tools: Vec<Box<dyn ExtractionTool>>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<Box<dyn ExtractionTool>>) -> Self {
        Self { tools }
    }

    pub fn standard(config: &PipelineConfig) -> Result<Self> {
        let mut tools: Vec<Box<dyn ExtractionTool>> = vec![
            Box::new(PdftotextBboxTool),
            Box::new(PdftotextLayoutTool),
            Box::new(PdftohtmlTool),
            Box::new(UpstageOcrTool::new(config)?),
            Box::new(UpstageDocumentParseTool::new(config)?),
        ];
        tools.retain(|tool| config.tool_enabled(tool.name()));

        for name in &config.enabled_tools {
            if !STANDARD_TOOL_ORDER.contains(&name.as_str()) {
                warn!(tool = %name, "ignoring unknown extraction tool");
            }
        }

        Ok(Self { tools })
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn ExtractionTool> {
        self.tools.iter().map(|tool| tool.as_ref())
    }

    pub fn get(&self, name: &str) -> Option<&dyn ExtractionTool> {
        self.iter().find(|tool| tool.name() == name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Checks an adapter's output before anything downstream sees it: page
/// numbers are 1-based and unique, pages come back sorted, fragments carry
/// finite coordinates and table shapes match their cell grids.
pub fn normalize_extraction(tool: &str, mut raw: RawExtraction) -> Result<RawExtraction> {
    let mut seen = BTreeSet::new();
    for page in &raw.pages {
        if page.page == 0 {
            bail!("{} produced a page numbered 0", tool);
        }
        if !seen.insert(page.page) {
            bail!("{} produced page {} more than once", tool, page.page);
        }
    }

    raw.pages.sort_by_key(|page| page.page);
    for page in &mut raw.pages {
        normalize_page(page);
    }

    Ok(raw)
}

pub fn normalize_page(page: &mut PageRecord) {
    page.text = page.text.replace('\u{0000}', "");

    let before = page.bbox.len();
    page.bbox.retain(|fragment| fragment.is_finite());
    if page.bbox.len() != before {
        warn!(
            page = page.page,
            dropped = before - page.bbox.len(),
            "dropped fragments with non-finite coordinates"
        );
    }

    if !page.width.is_finite() || page.width < 0.0 {
        page.width = 0.0;
    }
    if !page.height.is_finite() || page.height < 0.0 {
        page.height = 0.0;
    }

    page.tables = std::mem::take(&mut page.tables)
        .into_iter()
        .map(|table| TableGrid::from_rows(table.data))
        .filter(|table| table.rows > 0)
        .collect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TextFragment;

    fn page(number: u32, text: &str) -> PageRecord {
        PageRecord {
            page: number,
            text: text.to_string(),
            ..PageRecord::default()
        }
    }

    #[test]
    fn normalize_sorts_pages_and_repairs_shapes() {
        let mut second = page(2, "b\u{0000}");
        second.bbox.push(TextFragment {
            text: "nan".to_string(),
            x0: f64::NAN,
            y0: 0.0,
            x1: 1.0,
            y1: 1.0,
        });
        second.tables.push(TableGrid {
            rows: 9,
            cols: 9,
            data: vec![vec!["a".to_string(), "b".to_string()]],
        });

        let raw = RawExtraction {
            pages: vec![second, page(1, "a")],
            ..RawExtraction::default()
        };

        let normalized = normalize_extraction("fake", raw).unwrap();
        let numbers = normalized.pages.iter().map(|p| p.page).collect::<Vec<u32>>();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(normalized.pages[1].text, "b");
        assert!(normalized.pages[1].bbox.is_empty());
        assert_eq!(normalized.pages[1].tables[0].rows, 1);
        assert_eq!(normalized.pages[1].tables[0].cols, 2);
    }

    #[test]
    fn normalize_rejects_zero_and_duplicate_pages() {
        let zero = RawExtraction {
            pages: vec![page(0, "x")],
            ..RawExtraction::default()
        };
        assert!(normalize_extraction("fake", zero).is_err());

        let duplicate = RawExtraction {
            pages: vec![page(1, "x"), page(1, "y")],
            ..RawExtraction::default()
        };
        assert!(normalize_extraction("fake", duplicate).is_err());
    }
}
