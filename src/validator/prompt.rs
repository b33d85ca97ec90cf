use serde_json::Value;

use crate::llm::extract_json_block;
use crate::model::TableGrid;
use crate::util::truncate_chars;

const TABLE_PREVIEW_LIMIT: usize = 500;
const TABLE_PREVIEW_ROWS: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub passed: bool,
    pub confidence: f64,
    pub reason: String,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
}

impl Verdict {
    pub fn rejected(reason: String, issue: &str) -> Self {
        Self {
            passed: false,
            confidence: 0.0,
            reason,
            issues: vec![issue.to_string()],
            suggestions: Vec::new(),
        }
    }
}

pub fn validation_prompt(
    text: &str,
    page_number: u32,
    strategy: &str,
    tables: &[TableGrid],
    text_limit: usize,
) -> String {
    let total_chars = text.chars().count();
    let shown = truncate_chars(text, text_limit);
    let truncation_note = if total_chars > text_limit {
        format!("\n... ({} characters in total)", total_chars)
    } else {
        String::new()
    };

    let mut prompt = format!(
        "You are an expert reviewer of PDF text extraction output.\n\n\
         Document context\n\
         - Page: {page_number}\n\
         - Extraction strategy: {strategy}\n\
         - Tables detected: {}\n\n\
         Extracted text:\n```\n{shown}{truncation_note}\n```\n",
        if tables.is_empty() { "no" } else { "yes" },
    );

    if let Some(preview) = table_preview(tables) {
        prompt.push_str(&format!("\nTable preview:\n```\n{preview}\n```\n"));
    }

    prompt.push_str(
        "\nDecide whether this extraction is usable in practice. Consider:\n\
         1. Sentences read naturally, words are in order and not cut or interleaved.\n\
         2. Reading order is logical and multi-column layouts are handled.\n\
         3. Headers, footers and page numbers do not pollute the body text.\n\
         4. Tables keep their rows and columns when tables are present.\n\
         5. A person could read the text and recover its key information.\n\n\
         Pass anything usable even if imperfect; fail only serious problems such as\n\
         interleaved columns, broken sentences or destroyed tables. When failing,\n\
         suggest remedies by tool name: page_split for double-page spreads,\n\
         layout_reorder for column order problems, table_enhancement for tables.\n\n\
         Respond with JSON only:\n\
         {\"pass\": true, \"confidence\": 0.95, \"reason\": \"...\", \"issues\": [], \"suggestions\": []}\n",
    );

    prompt
}

fn table_preview(tables: &[TableGrid]) -> Option<String> {
    let table = tables.first()?;
    let mut preview = format!("{} rows x {} cols", table.rows, table.cols);
    for row in table.data.iter().take(TABLE_PREVIEW_ROWS) {
        preview.push('\n');
        preview.push_str(&row.join(" | "));
    }
    Some(truncate_chars(&preview, TABLE_PREVIEW_LIMIT).to_string())
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| match item {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Reads the judge's verdict. Anything that is not a JSON object becomes a
/// failing verdict tagged `parse_error`; missing fields default to a fail at
/// middling confidence.
pub fn parse_validation_response(reply: &str) -> Verdict {
    let parsed = serde_json::from_str::<Value>(extract_json_block(reply));
    let object = match parsed {
        Ok(value @ Value::Object(_)) => value,
        Ok(other) => {
            return Verdict::rejected(
                format!("Failed to parse validation response: expected an object, got {}", other),
                "parse_error",
            );
        }
        Err(err) => {
            return Verdict::rejected(
                format!("Failed to parse validation response: {}", err),
                "parse_error",
            );
        }
    };

    let passed = object.get("pass").and_then(Value::as_bool).unwrap_or(false);
    let confidence = object
        .get("confidence")
        .and_then(Value::as_f64)
        .filter(|value| value.is_finite())
        .unwrap_or(0.5)
        .clamp(0.0, 1.0);

    Verdict {
        passed,
        confidence,
        reason: object
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        issues: string_list(object.get("issues")),
        suggestions: string_list(object.get("suggestions")),
    }
}
