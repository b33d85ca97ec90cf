use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde_json::json;

use super::ExtractionTool;
use super::tables::detect_aligned_tables;
use crate::config::{TOOL_PDFTOHTML, TOOL_PDFTOTEXT, TOOL_PDFTOTEXT_LAYOUT};
use crate::model::{PageRecord, RawExtraction, TextFragment};

static PAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<page\b([^>]*)>(.*?)</page>").expect("valid page regex"));
static LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<line\b[^>]*>(.*?)</line>").expect("valid line regex"));
static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<word\b([^>]*)>(.*?)</word>").expect("valid word regex"));
static TEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<text\b([^>]*)>(.*?)</text>").expect("valid text regex"));
static ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(\w+)="([^"]*)""#).expect("valid attribute regex"));
static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid tag regex"));
static ENTITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&(#x[0-9a-fA-F]+|#[0-9]+|[a-zA-Z]+);").expect("valid entity regex"));

const LINE_TOLERANCE: f64 = 3.0;

pub struct PdftotextBboxTool;

pub struct PdftotextLayoutTool;

pub struct PdftohtmlTool;

impl ExtractionTool for PdftotextBboxTool {
    fn name(&self) -> &str {
        TOOL_PDFTOTEXT
    }

    fn version(&self) -> String {
        poppler_version("pdftotext")
    }

    fn extract(&self, source: &Path) -> Result<RawExtraction> {
        let output = run_poppler(
            "pdftotext",
            &["-bbox-layout", "-enc", "UTF-8"],
            source,
            Some("-"),
        )?;
        Ok(RawExtraction {
            pages: parse_bbox_layout(&output),
            settings: settings(&[("mode", json!("bbox-layout"))]),
        })
    }
}

impl ExtractionTool for PdftotextLayoutTool {
    fn name(&self) -> &str {
        TOOL_PDFTOTEXT_LAYOUT
    }

    fn version(&self) -> String {
        poppler_version("pdftotext")
    }

    fn extract(&self, source: &Path) -> Result<RawExtraction> {
        let output = run_poppler("pdftotext", &["-layout", "-enc", "UTF-8"], source, Some("-"))?;
        Ok(RawExtraction {
            pages: parse_layout_text(&output),
            settings: settings(&[("mode", json!("layout")), ("table_detection", json!("aligned-columns"))]),
        })
    }
}

impl ExtractionTool for PdftohtmlTool {
    fn name(&self) -> &str {
        TOOL_PDFTOHTML
    }

    fn version(&self) -> String {
        poppler_version("pdftohtml")
    }

    fn extract(&self, source: &Path) -> Result<RawExtraction> {
        let output = run_poppler(
            "pdftohtml",
            &["-xml", "-i", "-q", "-stdout", "-zoom", "1"],
            source,
            None,
        )?;
        Ok(RawExtraction {
            pages: parse_pdftohtml_xml(&output),
            settings: settings(&[("mode", json!("xml")), ("zoom", json!(1))]),
        })
    }
}

fn settings(entries: &[(&str, serde_json::Value)]) -> BTreeMap<String, serde_json::Value> {
    entries
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

fn poppler_version(program: &str) -> String {
    command_version_optional(program, &["-v"]).unwrap_or_else(|| "unknown".to_string())
}

pub fn command_version_optional(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let source = if stdout.trim().is_empty() {
        stderr.trim()
    } else {
        stdout.trim()
    };

    source
        .lines()
        .next()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| line.to_string())
}

fn run_poppler(program: &str, args: &[&str], source: &Path, sink: Option<&str>) -> Result<String> {
    let mut command = Command::new(program);
    command.args(args).arg(source);
    if let Some(sink) = sink {
        command.arg(sink);
    }

    let output = command
        .output()
        .with_context(|| format!("failed to execute {} for {}", program, source.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "{} returned non-zero exit status for {}: {}",
            program,
            source.display(),
            stderr.trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn attributes(raw: &str) -> BTreeMap<&str, &str> {
    ATTR_RE
        .captures_iter(raw)
        .filter_map(|caps| Some((caps.get(1)?.as_str(), caps.get(2)?.as_str())))
        .collect()
}

fn attr_f64(attrs: &BTreeMap<&str, &str>, key: &str) -> Option<f64> {
    attrs.get(key).and_then(|value| value.trim().parse::<f64>().ok())
}

pub(crate) fn decode_entities(raw: &str) -> String {
    ENTITY_RE
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            let entity = &caps[1];
            let decoded = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some(' '),
                _ if entity.starts_with("#x") => u32::from_str_radix(&entity[2..], 16)
                    .ok()
                    .and_then(char::from_u32),
                _ if entity.starts_with('#') => {
                    entity[1..].parse::<u32>().ok().and_then(char::from_u32)
                }
                _ => None,
            };
            decoded
                .map(|ch| ch.to_string())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Parses `pdftotext -bbox-layout` XHTML into one record per `<page>`.
pub(crate) fn parse_bbox_layout(xhtml: &str) -> Vec<PageRecord> {
    let mut pages = Vec::new();

    for (index, page_caps) in PAGE_RE.captures_iter(xhtml).enumerate() {
        let page_attrs = attributes(&page_caps[1]);
        let body = &page_caps[2];

        let mut lines = Vec::new();
        let mut fragments = Vec::new();

        for line_caps in LINE_RE.captures_iter(body) {
            let mut words = Vec::new();
            for word_caps in WORD_RE.captures_iter(&line_caps[1]) {
                let word_attrs = attributes(&word_caps[1]);
                let text = decode_entities(word_caps[2].trim());
                if text.is_empty() {
                    continue;
                }

                if let (Some(x0), Some(y0), Some(x1), Some(y1)) = (
                    attr_f64(&word_attrs, "xMin"),
                    attr_f64(&word_attrs, "yMin"),
                    attr_f64(&word_attrs, "xMax"),
                    attr_f64(&word_attrs, "yMax"),
                ) {
                    fragments.push(TextFragment {
                        text: text.clone(),
                        x0,
                        y0,
                        x1,
                        y1,
                    });
                }
                words.push(text);
            }

            if !words.is_empty() {
                lines.push(words.join(" "));
            }
        }

        pages.push(PageRecord {
            page: index as u32 + 1,
            text: lines.join("\n"),
            bbox: fragments,
            tables: Vec::new(),
            width: attr_f64(&page_attrs, "width").unwrap_or(0.0),
            height: attr_f64(&page_attrs, "height").unwrap_or(0.0),
        });
    }

    pages
}

/// Splits `pdftotext -layout` output on form feeds. Only the empty chunk
/// after the final form feed is dropped so blank pages keep their numbers.
pub(crate) fn parse_layout_text(raw: &str) -> Vec<PageRecord> {
    let mut chunks = raw.split('\u{000C}').collect::<Vec<&str>>();
    if chunks.len() > 1 && chunks.last().is_some_and(|chunk| chunk.trim().is_empty()) {
        chunks.pop();
    }

    chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| {
            let text = chunk.trim_end().to_string();
            PageRecord {
                page: index as u32 + 1,
                tables: detect_aligned_tables(&text),
                text,
                ..PageRecord::default()
            }
        })
        .collect()
}

/// Parses `pdftohtml -xml` output. Fragments sharing a baseline (within a
/// few points) are joined into one text line.
pub(crate) fn parse_pdftohtml_xml(xml: &str) -> Vec<PageRecord> {
    let mut pages = Vec::new();

    for (index, page_caps) in PAGE_RE.captures_iter(xml).enumerate() {
        let page_attrs = attributes(&page_caps[1]);
        let page_number = attr_f64(&page_attrs, "number")
            .map(|value| value as u32)
            .filter(|value| *value > 0)
            .unwrap_or(index as u32 + 1);

        let mut fragments = Vec::new();
        for text_caps in TEXT_RE.captures_iter(&page_caps[2]) {
            let attrs = attributes(&text_caps[1]);
            let text = decode_entities(TAG_RE.replace_all(&text_caps[2], "").trim());
            if text.is_empty() {
                continue;
            }

            let (Some(top), Some(left)) = (attr_f64(&attrs, "top"), attr_f64(&attrs, "left")) else {
                continue;
            };
            let width = attr_f64(&attrs, "width").unwrap_or(0.0);
            let height = attr_f64(&attrs, "height").unwrap_or(0.0);

            fragments.push(TextFragment {
                text,
                x0: left,
                y0: top,
                x1: left + width,
                y1: top + height,
            });
        }

        fragments.sort_by(|a, b| a.y0.total_cmp(&b.y0).then(a.x0.total_cmp(&b.x0)));

        pages.push(PageRecord {
            page: page_number,
            text: group_into_lines(&fragments).join("\n"),
            bbox: fragments,
            tables: Vec::new(),
            width: attr_f64(&page_attrs, "width").unwrap_or(0.0),
            height: attr_f64(&page_attrs, "height").unwrap_or(0.0),
        });
    }

    pages
}

fn group_into_lines(fragments: &[TextFragment]) -> Vec<String> {
    let mut lines: Vec<(f64, Vec<&TextFragment>)> = Vec::new();

    for fragment in fragments {
        match lines.last_mut() {
            Some((top, members)) if (fragment.y0 - *top).abs() <= LINE_TOLERANCE => {
                members.push(fragment);
            }
            _ => lines.push((fragment.y0, vec![fragment])),
        }
    }

    lines
        .into_iter()
        .map(|(_, mut members)| {
            members.sort_by(|a, b| a.x0.total_cmp(&b.x0));
            members
                .iter()
                .map(|fragment| fragment.text.as_str())
                .collect::<Vec<&str>>()
                .join(" ")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bbox_layout_pages_lines_and_words() {
        let xhtml = r#"<html><body><doc>
<page width="612.000000" height="792.000000">
  <flow><block xMin="72" yMin="70" xMax="200" yMax="100">
    <line xMin="72" yMin="70" xMax="200" yMax="82">
      <word xMin="72.0" yMin="70.0" xMax="100.0" yMax="82.0">Revenue</word>
      <word xMin="104.0" yMin="70.0" xMax="130.0" yMax="82.0">&amp;</word>
      <word xMin="134.0" yMin="70.0" xMax="170.0" yMax="82.0">costs</word>
    </line>
    <line xMin="72" yMin="86" xMax="200" yMax="98">
      <word xMin="72.0" yMin="86.0" xMax="120.0" yMax="98.0">grew</word>
    </line>
  </block></flow>
</page>
<page width="595.0" height="842.0">
</page>
</doc></body></html>"#;

        let pages = parse_bbox_layout(xhtml);
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].page, 1);
        assert_eq!(pages[0].text, "Revenue & costs\ngrew");
        assert_eq!(pages[0].bbox.len(), 4);
        assert_eq!(pages[0].bbox[1].text, "&");
        assert_eq!(pages[0].width, 612.0);
        assert_eq!(pages[1].page, 2);
        assert!(pages[1].text.is_empty());
        assert_eq!(pages[1].height, 842.0);
    }

    #[test]
    fn layout_text_keeps_inner_blank_pages() {
        let raw = "first page\n\u{000C}\u{000C}third page\n\u{000C}";
        let pages = parse_layout_text(raw);
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0].text, "first page");
        assert!(pages[1].text.is_empty());
        assert_eq!(pages[2].page, 3);
    }

    #[test]
    fn pdftohtml_fragments_are_grouped_by_line() {
        let xml = r#"<?xml version="1.0"?>
<pdf2xml>
<page number="1" position="absolute" top="0" left="0" height="792" width="612">
<text top="100" left="300" width="50" height="12" font="0">right</text>
<text top="100" left="72" width="50" height="12" font="0"><b>left</b></text>
<text top="130" left="72" width="80" height="12" font="0">next &lt;line&gt;</text>
</page>
</pdf2xml>"#;

        let pages = parse_pdftohtml_xml(xml);
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].text, "left right\nnext <line>");
        assert_eq!(pages[0].bbox[0].x1, 122.0);
        assert_eq!(pages[0].width, 612.0);
        assert_eq!(pages[0].height, 792.0);
    }

    #[test]
    fn decodes_numeric_entities_and_keeps_unknown_ones() {
        assert_eq!(decode_entities("&#65;&#x42;&unknown;"), "AB&unknown;");
    }
}
