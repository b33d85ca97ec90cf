use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

pub fn now_utc_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn utc_compact_string(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%SZ").to_string()
}

pub fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

pub fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}

pub fn ensure_directory(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory: {}", path.display()))
}

/// Hex SHA-256 of a document's bytes, used as its identity across runs.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .with_context(|| format!("cannot open {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .with_context(|| format!("cannot hash {}", path.display()))?;
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut writer = create_writer(path)?;
    serde_json::to_writer_pretty(&mut writer, value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    writer
        .write_all(b"\n")
        .and_then(|_| writer.flush())
        .with_context(|| format!("failed to write {}", path.display()))
}

fn create_writer(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        ensure_directory(parent)?;
    }
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    Ok(BufWriter::new(file))
}

pub fn write_json_lines<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut writer = create_writer(path)?;
    for row in rows {
        serde_json::to_writer(&mut writer, row)
            .with_context(|| format!("failed to serialize jsonl row: {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write jsonl file: {}", path.display()))?;
    }

    writer
        .flush()
        .with_context(|| format!("failed to flush jsonl file: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_chars_respects_multibyte_boundaries() {
        assert_eq!(truncate_chars("페이지 텍스트", 3), "페이지");
        assert_eq!(truncate_chars("short", 20), "short");
        assert_eq!(truncate_chars("", 0), "");
    }

    #[test]
    fn write_json_lines_emits_one_row_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("rows.jsonl");

        write_json_lines(&path, &[serde_json::json!({"page": 1}), serde_json::json!({"page": 2})])
            .unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        let lines = raw.lines().collect::<Vec<&str>>();
        assert_eq!(lines, vec![r#"{"page":1}"#, r#"{"page":2}"#]);
    }

    #[test]
    fn sha256_file_hashes_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.bin");
        fs::write(&path, b"abc").unwrap();

        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
