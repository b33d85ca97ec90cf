use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::util::sha256_file;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSource {
    pub path: PathBuf,
    pub name: String,
    pub stem: String,
    pub sha256: String,
}

impl DocumentSource {
    pub fn open(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|value| value.to_str())
            .map(ToOwned::to_owned)
            .with_context(|| format!("invalid UTF-8 filename: {}", path.display()))?;
        let stem = path
            .file_stem()
            .and_then(|value| value.to_str())
            .unwrap_or("document")
            .to_string();
        let sha256 = sha256_file(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            name,
            stem,
            sha256,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextFragment {
    pub text: String,
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl TextFragment {
    pub fn x_center(&self) -> f64 {
        (self.x0 + self.x1) / 2.0
    }

    pub fn is_finite(&self) -> bool {
        [self.x0, self.y0, self.x1, self.y1]
            .iter()
            .all(|value| value.is_finite())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableGrid {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<Vec<String>>,
}

impl TableGrid {
    pub fn from_rows(data: Vec<Vec<String>>) -> Self {
        Self {
            rows: data.len(),
            cols: data.iter().map(Vec::len).max().unwrap_or(0),
            data,
        }
    }
}

/// One page in the shape every extraction and fallback tool agrees on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    pub page: u32,
    pub text: String,
    pub bbox: Vec<TextFragment>,
    pub tables: Vec<TableGrid>,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawExtraction {
    pub pages: Vec<PageRecord>,
    pub settings: BTreeMap<String, serde_json::Value>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Success,
    Failed,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageExtraction {
    pub page_number: u32,
    pub strategy: String,
    pub text: String,
    pub bbox: Vec<TextFragment>,
    pub tables: Vec<TableGrid>,
    pub width: f64,
    pub height: f64,
    pub processing_time_ms: f64,
    pub status: RecordStatus,
    pub error_message: Option<String>,
}

impl PageExtraction {
    pub fn from_record(strategy: &str, record: PageRecord, processing_time_ms: f64) -> Self {
        Self {
            page_number: record.page,
            strategy: strategy.to_string(),
            text: record.text,
            bbox: record.bbox,
            tables: record.tables,
            width: record.width,
            height: record.height,
            processing_time_ms,
            status: RecordStatus::Success,
            error_message: None,
        }
    }

    pub fn to_record(&self) -> PageRecord {
        PageRecord {
            page: self.page_number,
            text: self.text.clone(),
            bbox: self.bbox.clone(),
            tables: self.tables.clone(),
            width: self.width,
            height: self.height,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub strategy: String,
    pub tool_version: String,
    pub sampled_pages: Vec<u32>,
    pub pages: Vec<PageExtraction>,
    pub total_page_count: usize,
    pub sampled_page_count: usize,
    pub processing_time_ms: f64,
    pub cost_usd: f64,
    pub status: RecordStatus,
    pub error_message: Option<String>,
    pub settings: BTreeMap<String, serde_json::Value>,
}

impl ExtractionRecord {
    pub fn failed(strategy: &str, tool_version: String, message: String, elapsed_ms: f64) -> Self {
        Self {
            strategy: strategy.to_string(),
            tool_version,
            sampled_pages: Vec::new(),
            pages: Vec::new(),
            total_page_count: 0,
            sampled_page_count: 0,
            processing_time_ms: elapsed_ms,
            cost_usd: 0.0,
            status: RecordStatus::Failed,
            error_message: Some(message),
            settings: BTreeMap::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RecordStatus::Success
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackKind {
    PageSplit,
    LayoutReorder,
    TableEnhancement,
}

impl FallbackKind {
    pub const ALL: [FallbackKind; 3] = [
        FallbackKind::PageSplit,
        FallbackKind::LayoutReorder,
        FallbackKind::TableEnhancement,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PageSplit => "page_split",
            Self::LayoutReorder => "layout_reorder",
            Self::TableEnhancement => "table_enhancement",
        }
    }
}

impl fmt::Display for FallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn strategy_label(base: &str, fallback_path: &[FallbackKind]) -> String {
    let mut label = base.to_string();
    for kind in fallback_path {
        label.push('+');
        label.push_str(kind.as_str());
    }
    label
}

/// What the validation judge said about a page, plus the text it was shown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationNotes {
    pub reason: String,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    pub page_text: String,
    pub table_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageValidation {
    pub page_number: u32,
    pub strategy: String,
    pub passed: bool,
    pub confidence: f64,
    pub fallback_path: Vec<FallbackKind>,
    pub fallback_attempts: usize,
    pub processing_time_ms: f64,
    pub notes: ValidationNotes,
}

impl PageValidation {
    pub fn label(&self) -> String {
        strategy_label(&self.strategy, &self.fallback_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyValidation {
    pub strategy: String,
    pub passed: bool,
    pub pages: Vec<PageValidation>,
    pub average_confidence: f64,
    pub fallback_tools: Vec<FallbackKind>,
    pub total_fallback_attempts: usize,
    pub average_processing_time_ms: f64,
}

impl StrategyValidation {
    pub fn from_pages(strategy: &str, pages: Vec<PageValidation>) -> Self {
        let count = pages.len().max(1) as f64;
        let average_confidence = pages.iter().map(|page| page.confidence).sum::<f64>() / count;
        let average_processing_time_ms =
            pages.iter().map(|page| page.processing_time_ms).sum::<f64>() / count;

        let mut fallback_tools = pages
            .iter()
            .flat_map(|page| page.fallback_path.iter().copied())
            .collect::<Vec<FallbackKind>>();
        fallback_tools.sort();
        fallback_tools.dedup();

        Self {
            strategy: strategy.to_string(),
            passed: pages.iter().all(|page| page.passed),
            total_fallback_attempts: pages.iter().map(|page| page.fallback_attempts).sum(),
            average_confidence,
            average_processing_time_ms,
            fallback_tools,
            pages,
        }
    }

    pub fn passed_pages(&self) -> impl Iterator<Item = &PageValidation> {
        self.pages.iter().filter(|page| page.passed)
    }

    pub fn page_pass_rate(&self) -> f64 {
        if self.pages.is_empty() {
            return 0.0;
        }
        self.passed_pages().count() as f64 / self.pages.len() as f64
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grade {
    Pass,
    Borderline,
    Fail,
}

impl Grade {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Borderline => "borderline",
            Self::Fail => "fail",
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AxisScores {
    pub read: f64,
    pub sentence: f64,
    pub noise: f64,
    pub table: f64,
    pub figure: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageJudgment {
    pub page_number: u32,
    pub strategy: String,
    pub scores: AxisScores,
    pub total: f64,
    pub grade: Grade,
    pub rationale: String,
    pub comments: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyJudgment {
    pub strategy: String,
    pub pages: Vec<PageJudgment>,
    pub scores: AxisScores,
    pub total: f64,
    pub grade: Grade,
    pub speed_ms_per_page: f64,
    pub fallback_tools: Vec<FallbackKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionMetadata {
    pub candidate_count: usize,
    pub pass_count: usize,
    pub composite_score: f64,
    pub tie_break_applied: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalSelection {
    pub document: String,
    pub strategy: String,
    pub total: f64,
    pub speed_ms_per_page: f64,
    pub rationale: String,
    pub metadata: SelectionMetadata,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extraction,
    Validation,
    Judge,
    Report,
    Completed,
    Failed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::Validation => "validation",
            Self::Judge => "judge",
            Self::Report => "report",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub stage: Stage,
    pub message: String,
    pub error_type: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedCombination {
    pub strategy: String,
    pub average_confidence: f64,
    pub page_pass_rate: f64,
    pub timestamp: String,
}

/// Everything a run hands to reporting and persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub document: String,
    pub sha256: String,
    pub stage: Stage,
    pub started_at: String,
    pub finished_at: String,
    pub extractions: Vec<ExtractionRecord>,
    pub validations: Vec<StrategyValidation>,
    pub judgments: Vec<StrategyJudgment>,
    pub selection: Option<FinalSelection>,
    pub failed_combinations: Vec<FailedCombination>,
    pub error_log: Vec<ErrorEntry>,
}

impl RunOutcome {
    pub fn failure_reason(&self) -> Option<&ErrorEntry> {
        if self.stage != Stage::Failed {
            return None;
        }
        self.error_log.last()
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.extractions.iter().map(|record| record.cost_usd).sum()
    }
}
