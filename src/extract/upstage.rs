use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;
use reqwest::blocking::{Client, multipart};
use serde_json::{Value, json};
use tracing::debug;

use super::ExtractionTool;
use super::poppler::decode_entities;
use crate::config::{PipelineConfig, TOOL_UPSTAGE_DOCUMENT_PARSE, TOOL_UPSTAGE_OCR};
use crate::model::{PageRecord, RawExtraction, TableGrid, TextFragment};

static ROW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<tr\b[^>]*>(.*?)</tr>").expect("valid row regex"));
static CELL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<t[dh]\b[^>]*>(.*?)</t[dh]>").expect("valid cell regex"));
static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid tag regex"));
static SPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

struct UpstageEndpoint {
    client: Client,
    url: String,
    api_key: Option<String>,
}

impl UpstageEndpoint {
    fn new(config: &PipelineConfig, path: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.ocr_timeout)
            .build()
            .context("failed to build document API client")?;

        Ok(Self {
            client,
            url: format!("{}/{}", config.api_base.trim_end_matches('/'), path),
            api_key: config.api_key.clone(),
        })
    }

    fn post(&self, source: &Path, fields: &[(&str, &str)]) -> Result<Value> {
        let Some(api_key) = self.api_key.as_deref() else {
            bail!("no API key configured for {}", self.url);
        };

        let mut form = multipart::Form::new()
            .file("document", source)
            .with_context(|| format!("failed to attach {}", source.display()))?;
        for (key, value) in fields {
            form = form.text(key.to_string(), value.to_string());
        }

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .with_context(|| format!("failed to call {}", self.url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            bail!("document API error {}: {}", status, body);
        }

        response
            .json::<Value>()
            .with_context(|| format!("failed to parse response from {}", self.url))
    }
}

pub struct UpstageOcrTool {
    endpoint: UpstageEndpoint,
}

impl UpstageOcrTool {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            endpoint: UpstageEndpoint::new(config, "document-ai/ocr")?,
        })
    }
}

impl ExtractionTool for UpstageOcrTool {
    fn name(&self) -> &str {
        TOOL_UPSTAGE_OCR
    }

    fn version(&self) -> String {
        "upstage-ocr-v1".to_string()
    }

    fn extract(&self, source: &Path) -> Result<RawExtraction> {
        let response = self.endpoint.post(source, &[])?;
        let pages = parse_ocr_response(&response);
        debug!(pages = pages.len(), "ocr response parsed");

        Ok(RawExtraction {
            pages,
            settings: BTreeMap::from([
                ("api".to_string(), json!("upstage-ocr")),
                ("version".to_string(), json!(self.version())),
            ]),
        })
    }
}

pub struct UpstageDocumentParseTool {
    endpoint: UpstageEndpoint,
}

impl UpstageDocumentParseTool {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            endpoint: UpstageEndpoint::new(config, "document-ai/document-parse")?,
        })
    }
}

impl ExtractionTool for UpstageDocumentParseTool {
    fn name(&self) -> &str {
        TOOL_UPSTAGE_DOCUMENT_PARSE
    }

    fn version(&self) -> String {
        "upstage-document-parse-v1".to_string()
    }

    fn extract(&self, source: &Path) -> Result<RawExtraction> {
        let response = self.endpoint.post(
            source,
            &[("ocr", "auto"), ("output_formats", "[\"text\", \"html\"]")],
        )?;
        let pages = parse_document_parse_response(&response);
        debug!(pages = pages.len(), "document parse response parsed");

        Ok(RawExtraction {
            pages,
            settings: BTreeMap::from([
                ("api".to_string(), json!("upstage-document-parse")),
                ("version".to_string(), json!(self.version())),
                ("ocr".to_string(), json!("auto")),
            ]),
        })
    }
}

fn number(value: &Value, key: &str) -> f64 {
    value.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

/// Reads either `{x, y, width, height}` or a polygon of `{x, y}` vertices.
fn fragment_from(coordinates: &Value, text: &str) -> Option<TextFragment> {
    let vertices = coordinates
        .as_array()
        .or_else(|| coordinates.get("vertices").and_then(Value::as_array));

    if let Some(vertices) = vertices {
        let xs = vertices.iter().filter_map(|v| v.get("x").and_then(Value::as_f64));
        let ys = vertices.iter().filter_map(|v| v.get("y").and_then(Value::as_f64));
        let (x0, x1) = xs.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), x| (lo.min(x), hi.max(x)));
        let (y0, y1) = ys.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), y| (lo.min(y), hi.max(y)));
        let fragment = TextFragment {
            text: text.to_string(),
            x0,
            y0,
            x1,
            y1,
        };
        return fragment.is_finite().then_some(fragment);
    }

    if coordinates.is_object() {
        let x = number(coordinates, "x");
        let y = number(coordinates, "y");
        return Some(TextFragment {
            text: text.to_string(),
            x0: x,
            y0: y,
            x1: x + number(coordinates, "width"),
            y1: y + number(coordinates, "height"),
        });
    }

    None
}

fn content_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(text)) => text.clone(),
        Some(content @ Value::Object(_)) => {
            if let Some(text) = content.get("text").and_then(Value::as_str).filter(|t| !t.is_empty()) {
                return text.to_string();
            }
            if let Some(markdown) = content.get("markdown").and_then(Value::as_str).filter(|t| !t.is_empty()) {
                return markdown.to_string();
            }
            content
                .get("html")
                .and_then(Value::as_str)
                .map(html_to_text)
                .unwrap_or_default()
        }
        _ => String::new(),
    }
}

pub(crate) fn html_to_text(html: &str) -> String {
    let stripped = TAG_RE.replace_all(html, " ");
    let decoded = decode_entities(&stripped);
    SPACE_RE.replace_all(&decoded, " ").trim().to_string()
}

pub(crate) fn table_from_html(html: &str) -> Option<TableGrid> {
    let rows = ROW_RE
        .captures_iter(html)
        .map(|row| {
            CELL_RE
                .captures_iter(&row[1])
                .map(|cell| html_to_text(&cell[1]))
                .collect::<Vec<String>>()
        })
        .filter(|cells| !cells.is_empty())
        .collect::<Vec<Vec<String>>>();

    (!rows.is_empty()).then(|| TableGrid::from_rows(rows))
}

fn table_from_rows(value: &Value) -> Option<TableGrid> {
    let rows = value.get("rows")?.as_array()?;
    let data = rows
        .iter()
        .map(|row| {
            row.as_array()
                .map(|cells| {
                    cells
                        .iter()
                        .map(|cell| match cell {
                            Value::String(text) => text.clone(),
                            Value::Null => String::new(),
                            other => other.to_string(),
                        })
                        .collect::<Vec<String>>()
                })
                .unwrap_or_default()
        })
        .collect::<Vec<Vec<String>>>();

    (!data.is_empty()).then(|| TableGrid::from_rows(data))
}

pub(crate) fn parse_ocr_response(response: &Value) -> Vec<PageRecord> {
    if let Some(pages) = response.get("pages").and_then(Value::as_array) {
        return pages
            .iter()
            .enumerate()
            .map(|(index, page)| {
                let mut bbox = Vec::new();
                for key in ["words", "coordinates"] {
                    for item in page.get(key).and_then(Value::as_array).into_iter().flatten() {
                        let text = item.get("text").and_then(Value::as_str).unwrap_or_default();
                        let geometry = item.get("boundingBox").unwrap_or(item);
                        if let Some(fragment) = fragment_from(geometry, text) {
                            bbox.push(fragment);
                        }
                    }
                }

                let tables = page
                    .get("tables")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(|table| {
                        table
                            .get("data")
                            .map(|data| json!({ "rows": data }))
                            .and_then(|wrapped| table_from_rows(&wrapped))
                    })
                    .collect();

                PageRecord {
                    page: index as u32 + 1,
                    text: page.get("text").and_then(Value::as_str).unwrap_or_default().to_string(),
                    bbox,
                    tables,
                    width: number(page, "width"),
                    height: number(page, "height"),
                }
            })
            .collect();
    }

    let text = content_text(response.get("content").or_else(|| response.get("text")));
    vec![PageRecord {
        page: 1,
        text,
        ..PageRecord::default()
    }]
}

pub(crate) fn parse_document_parse_response(response: &Value) -> Vec<PageRecord> {
    let mut pages: BTreeMap<u32, PageRecord> = BTreeMap::new();

    if let Some(elements) = response.get("elements").and_then(Value::as_array) {
        for element in elements {
            let page_number = element
                .get("page")
                .and_then(Value::as_u64)
                .filter(|page| *page > 0)
                .unwrap_or(1) as u32;
            let page = pages.entry(page_number).or_insert_with(|| PageRecord {
                page: page_number,
                ..PageRecord::default()
            });

            let category = element
                .get("category")
                .or_else(|| element.get("type"))
                .and_then(Value::as_str)
                .unwrap_or("paragraph");

            if category == "table" {
                let html = element
                    .get("content")
                    .and_then(|content| content.get("html"))
                    .and_then(Value::as_str);
                let table = element
                    .get("table")
                    .and_then(table_from_rows)
                    .or_else(|| html.and_then(table_from_html));
                if let Some(table) = table {
                    page.tables.push(table);
                }
                continue;
            }

            let text = content_text(element.get("content"));
            if text.trim().is_empty() {
                continue;
            }

            if let Some(fragment) = element
                .get("coordinates")
                .and_then(|coordinates| fragment_from(coordinates, &text))
            {
                page.bbox.push(fragment);
            }

            if !page.text.is_empty() {
                page.text.push('\n');
            }
            page.text.push_str(&text);
        }
    }

    if pages.is_empty() {
        let text = match response.get("content") {
            Some(content) => content_text(Some(content)),
            None => response
                .get("html")
                .and_then(Value::as_str)
                .map(html_to_text)
                .unwrap_or_default(),
        };
        pages.insert(
            1,
            PageRecord {
                page: 1,
                text,
                ..PageRecord::default()
            },
        );
    }

    let reported = response
        .get("usage")
        .and_then(|usage| usage.get("pages"))
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    for page_number in 1..=reported {
        pages.entry(page_number).or_insert_with(|| PageRecord {
            page: page_number,
            ..PageRecord::default()
        });
    }

    pages.into_values().collect()
}
