use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::model::FallbackKind;

pub const API_KEY_ENV: &str = "SOLAR_API_KEY";
pub const DEFAULT_API_BASE: &str = "https://api.upstage.ai/v1";
pub const DEFAULT_MODEL: &str = "solar-pro2";

pub const TOOL_PDFTOTEXT: &str = "pdftotext";
pub const TOOL_PDFTOTEXT_LAYOUT: &str = "pdftotext_layout";
pub const TOOL_PDFTOHTML: &str = "pdftohtml";
pub const TOOL_UPSTAGE_OCR: &str = "upstage_ocr";
pub const TOOL_UPSTAGE_DOCUMENT_PARSE: &str = "upstage_document_parse";

pub const STANDARD_TOOL_ORDER: [&str; 5] = [
    TOOL_PDFTOTEXT,
    TOOL_PDFTOTEXT_LAYOUT,
    TOOL_PDFTOHTML,
    TOOL_UPSTAGE_OCR,
    TOOL_UPSTAGE_DOCUMENT_PARSE,
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JudgeWeights {
    pub read: f64,
    pub sentence: f64,
    pub noise: f64,
    pub table: f64,
    pub figure: f64,
}

impl Default for JudgeWeights {
    fn default() -> Self {
        Self {
            read: 0.25,
            sentence: 0.25,
            noise: 0.15,
            table: 0.25,
            figure: 0.10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradeThresholds {
    pub pass: f64,
    pub borderline: f64,
}

impl Default for GradeThresholds {
    fn default() -> Self {
        Self {
            pass: 85.0,
            borderline: 70.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JudgeDefaults {
    pub read: f64,
    pub sentence: f64,
    pub noise: f64,
    pub table: f64,
    pub figure: f64,
}

impl Default for JudgeDefaults {
    fn default() -> Self {
        Self {
            read: 75.0,
            sentence: 75.0,
            noise: 75.0,
            table: 85.0,
            figure: 80.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FallbackSearchConfig {
    pub priority: Vec<FallbackKind>,
    pub max_single_combinations: usize,
    pub pair_pool_size: usize,
    pub max_combinations: usize,
    /// Combinations with a 1-based index above this value stop the search
    /// when they fail to raise the best confidence.
    pub early_stop_after: usize,
    pub plateau_is_no_improvement: bool,
}

impl Default for FallbackSearchConfig {
    fn default() -> Self {
        Self {
            priority: vec![
                FallbackKind::PageSplit,
                FallbackKind::LayoutReorder,
                FallbackKind::TableEnhancement,
            ],
            max_single_combinations: 5,
            pair_pool_size: 4,
            max_combinations: 15,
            early_stop_after: 2,
            plateau_is_no_improvement: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectionConfig {
    pub quality_weight: f64,
    pub speed_weight: f64,
    pub speed_reference_ms_per_page: f64,
    pub tie_margin: f64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            quality_weight: 0.8,
            speed_weight: 0.2,
            speed_reference_ms_per_page: 1500.0,
            tie_margin: 2.0,
        }
    }
}

/// Settings for one pipeline run, built once and shared by reference.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub llm_timeout: Duration,
    pub ocr_timeout: Duration,
    pub max_sampled_pages: usize,
    pub sample_seed: Option<u64>,
    pub min_text_chars: usize,
    pub validation_text_limit: usize,
    pub judge_text_limit: usize,
    pub fallback: FallbackSearchConfig,
    pub judge_weights: JudgeWeights,
    pub grade_thresholds: GradeThresholds,
    pub judge_defaults: JudgeDefaults,
    pub selection: SelectionConfig,
    pub cost_per_page: BTreeMap<String, f64>,
    pub workspace_root: PathBuf,
    pub save_intermediate: bool,
    pub enabled_tools: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let cost_per_page = BTreeMap::from([
            (TOOL_UPSTAGE_OCR.to_string(), 0.0015),
            (TOOL_UPSTAGE_DOCUMENT_PARSE.to_string(), 0.01),
            (TOOL_PDFTOTEXT.to_string(), 0.0),
            (TOOL_PDFTOTEXT_LAYOUT.to_string(), 0.0),
            (TOOL_PDFTOHTML.to_string(), 0.0),
        ]);

        Self {
            api_key: None,
            api_base: DEFAULT_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.3,
            max_tokens: 4096,
            llm_timeout: Duration::from_secs(120),
            ocr_timeout: Duration::from_secs(300),
            max_sampled_pages: 5,
            sample_seed: None,
            min_text_chars: 20,
            validation_text_limit: 2000,
            judge_text_limit: 1000,
            fallback: FallbackSearchConfig::default(),
            judge_weights: JudgeWeights::default(),
            grade_thresholds: GradeThresholds::default(),
            judge_defaults: JudgeDefaults::default(),
            selection: SelectionConfig::default(),
            cost_per_page,
            workspace_root: PathBuf::from(".cache/docbench"),
            save_intermediate: true,
            enabled_tools: STANDARD_TOOL_ORDER.iter().map(|name| name.to_string()).collect(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let api_key = std::env::var(API_KEY_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        Self {
            api_key,
            ..Self::default()
        }
    }

    pub fn cost_for(&self, tool: &str) -> f64 {
        self.cost_per_page.get(tool).copied().unwrap_or(0.0)
    }

    pub fn tool_enabled(&self, tool: &str) -> bool {
        self.enabled_tools.iter().any(|name| name == tool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn judge_weights_sum_to_one() {
        let weights = JudgeWeights::default();
        let sum = weights.read + weights.sentence + weights.noise + weights.table + weights.figure;
        assert!((sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn local_tools_cost_nothing_and_unknown_tools_default_to_zero() {
        let config = PipelineConfig::default();
        assert_eq!(config.cost_for(TOOL_PDFTOTEXT), 0.0);
        assert_eq!(config.cost_for(TOOL_UPSTAGE_OCR), 0.0015);
        assert_eq!(config.cost_for(TOOL_UPSTAGE_DOCUMENT_PARSE), 0.01);
        assert_eq!(config.cost_for("unregistered"), 0.0);
    }

    #[test]
    fn all_standard_tools_are_enabled_by_default() {
        let config = PipelineConfig::default();
        for tool in STANDARD_TOOL_ORDER {
            assert!(config.tool_enabled(tool));
        }
    }
}
