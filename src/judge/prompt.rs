use std::collections::BTreeMap;

use serde_json::Value;

use crate::config::JudgeDefaults;
use crate::llm::extract_json_block;
use crate::model::AxisScores;
use crate::util::truncate_chars;

#[derive(Debug, Clone, PartialEq)]
pub struct QualityScores {
    pub scores: AxisScores,
    pub rationale: String,
    pub comments: BTreeMap<String, String>,
}

impl QualityScores {
    pub fn defaults(defaults: &JudgeDefaults, rationale: String) -> Self {
        Self {
            scores: AxisScores {
                read: defaults.read,
                sentence: defaults.sentence,
                noise: defaults.noise,
                table: defaults.table,
                figure: defaults.figure,
            },
            rationale,
            comments: BTreeMap::new(),
        }
    }
}

pub fn quality_prompt(
    document_name: &str,
    strategy: &str,
    page_number: u32,
    text: &str,
    table_count: usize,
    text_limit: usize,
) -> String {
    let shown = truncate_chars(text, text_limit);
    let table_line = if table_count > 0 {
        format!("\n- Tables: {table_count}")
    } else {
        String::new()
    };

    format!(
        "You are an expert grading the quality of PDF text extraction.\n\n\
         This text already passed a usability check. Several strategies passed,\n\
         and these scores decide which one is best, so grade precisely.\n\n\
         - Strategy: {strategy}\n\
         - Document: {document_name}\n\
         - Page: {page_number}{table_line}\n\n\
         Extracted text:\n```\n[page {page_number}]\n{shown}\n```\n\n\
         Score each axis from 0 to 100:\n\
         S_read: reading order, multi-column handling, list and heading structure.\n\
         S_sent: sentences complete, words not cut or glued, natural spacing.\n\
         S_noise: headers, footers, page numbers and stray symbols removed.\n\
         S_table: rows and columns separated, cells in place. Give 90 when there is no table.\n\
         S_fig: figure captions, chart labels and legends present. Give 85 when there is no figure.\n\n\
         Text that passed the usability check should rarely score below 60.\n\
         Explain the scores in rationale and give one comment per axis.\n\n\
         Respond with JSON only:\n\
         {{\"S_read\": 88, \"S_sent\": 92, \"S_noise\": 85, \"S_table\": 90, \"S_fig\": 85,\n\
         \"rationale\": \"...\",\n\
         \"comments\": {{\"read\": \"...\", \"sent\": \"...\", \"noise\": \"...\", \"table\": \"...\", \"fig\": \"...\"}}}}\n"
    )
}

fn score(object: &Value, key: &str, default: f64) -> f64 {
    let value = match object.get(key) {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    value
        .filter(|value| value.is_finite())
        .unwrap_or(default)
        .clamp(0.0, 100.0)
}

/// Reads the five axis scores. Unparseable replies and missing axes fall
/// back to `defaults`; every score is clamped to 0..=100.
pub fn parse_quality_response(reply: &str, defaults: &JudgeDefaults) -> QualityScores {
    let object = match serde_json::from_str::<Value>(extract_json_block(reply)) {
        Ok(value @ Value::Object(_)) => value,
        Ok(_) => {
            return QualityScores::defaults(
                defaults,
                "Failed to parse quality response: expected an object; default scores applied".to_string(),
            );
        }
        Err(err) => {
            return QualityScores::defaults(
                defaults,
                format!("Failed to parse quality response: {err}; default scores applied"),
            );
        }
    };

    let comments = object
        .get("comments")
        .and_then(Value::as_object)
        .map(|entries| {
            entries
                .iter()
                .map(|(axis, comment)| {
                    let comment = match comment {
                        Value::String(text) => text.clone(),
                        other => other.to_string(),
                    };
                    (axis.clone(), comment)
                })
                .collect()
        })
        .unwrap_or_default();

    QualityScores {
        scores: AxisScores {
            read: score(&object, "S_read", defaults.read),
            sentence: score(&object, "S_sent", defaults.sentence),
            noise: score(&object, "S_noise", defaults.noise),
            table: score(&object, "S_table", defaults.table),
            figure: score(&object, "S_fig", defaults.figure),
        },
        rationale: object
            .get("rationale")
            .and_then(Value::as_str)
            .unwrap_or("evaluation complete")
            .to_string(),
        comments,
    }
}
