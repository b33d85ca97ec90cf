use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;

use crate::extract::ExtractionTool;
use crate::fallback::{FallbackRegistry, FallbackTool, PageTransform};
use crate::llm::{ChatModel, LlmError};
use crate::model::{
    DocumentSource, ExtractionRecord, FallbackKind, PageExtraction, PageRecord, RawExtraction,
    RecordStatus,
};

/// Replays canned replies in order, then reports an empty response.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Result<String, LlmError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ChatModel for ScriptedModel {
    fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(LlmError::EmptyResponse))
    }
}

/// Answers each prompt with a closure, counting calls.
pub struct FnModel<F> {
    respond: F,
    calls: AtomicUsize,
}

impl<F> FnModel<F>
where
    F: Fn(&str) -> Result<String, LlmError> + Send + Sync,
{
    pub fn new(respond: F) -> Self {
        Self {
            respond,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<F> ChatModel for FnModel<F>
where
    F: Fn(&str) -> Result<String, LlmError> + Send + Sync,
{
    fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.respond)(prompt)
    }
}

pub fn verdict_reply(passed: bool, confidence: f64) -> Result<String, LlmError> {
    Ok(format!(
        "```json\n{{\"pass\": {passed}, \"confidence\": {confidence}, \"reason\": \"scripted\", \"issues\": [], \"suggestions\": []}}\n```"
    ))
}

pub fn scores_reply(score: f64) -> Result<String, LlmError> {
    Ok(format!(
        "{{\"S_read\": {score}, \"S_sent\": {score}, \"S_noise\": {score}, \"S_table\": {score}, \"S_fig\": {score}, \"rationale\": \"scripted\", \"comments\": {{\"read\": \"ok\"}}}}"
    ))
}

/// Appends a marker so tests can tell which transforms ran.
pub struct MarkerTransform(pub &'static str);

impl PageTransform for MarkerTransform {
    fn process(&self, pages: Vec<PageRecord>, _source: &Path) -> Result<Vec<PageRecord>> {
        Ok(pages
            .into_iter()
            .map(|mut page| {
                page.text.push_str(self.0);
                page
            })
            .collect())
    }
}

pub fn marker_fallbacks() -> FallbackRegistry {
    let mut registry = FallbackRegistry::empty();
    registry.insert(FallbackKind::PageSplit, FallbackTool::Transform(Box::new(MarkerTransform(" [split]"))));
    registry.insert(FallbackKind::LayoutReorder, FallbackTool::Transform(Box::new(MarkerTransform(" [layout]"))));
    registry.insert(
        FallbackKind::TableEnhancement,
        FallbackTool::Transform(Box::new(MarkerTransform(" [table]"))),
    );
    registry
}

/// Returns the same page texts for every document.
pub struct StaticTool {
    pub name: &'static str,
    pub texts: Vec<String>,
}

impl ExtractionTool for StaticTool {
    fn name(&self) -> &str {
        self.name
    }

    fn version(&self) -> String {
        "static-1".to_string()
    }

    fn extract(&self, _source: &Path) -> Result<RawExtraction> {
        Ok(RawExtraction {
            pages: self
                .texts
                .iter()
                .enumerate()
                .map(|(index, text)| PageRecord {
                    page: index as u32 + 1,
                    text: text.clone(),
                    width: 612.0,
                    height: 792.0,
                    ..PageRecord::default()
                })
                .collect(),
            settings: BTreeMap::new(),
        })
    }
}

pub fn document() -> DocumentSource {
    DocumentSource {
        path: PathBuf::from("fixture.pdf"),
        name: "fixture.pdf".to_string(),
        stem: "fixture".to_string(),
        sha256: "ab".repeat(32),
    }
}

pub fn record(strategy: &str, texts: &[&str]) -> ExtractionRecord {
    let pages = texts
        .iter()
        .enumerate()
        .map(|(index, text)| {
            PageExtraction::from_record(
                strategy,
                PageRecord {
                    page: index as u32 + 1,
                    text: text.to_string(),
                    ..PageRecord::default()
                },
                10.0,
            )
        })
        .collect::<Vec<PageExtraction>>();

    ExtractionRecord {
        strategy: strategy.to_string(),
        tool_version: "test".to_string(),
        sampled_pages: (1..=texts.len() as u32).collect(),
        total_page_count: texts.len(),
        sampled_page_count: texts.len(),
        processing_time_ms: 10.0 * texts.len() as f64,
        cost_usd: 0.0,
        status: RecordStatus::Success,
        error_message: None,
        settings: BTreeMap::new(),
        pages,
    }
}
