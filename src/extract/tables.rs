use std::sync::LazyLock;

use regex::Regex;

use crate::model::TableGrid;

static COLUMN_GAP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s{2,}").expect("valid column gap regex"));

const MIN_TABLE_ROWS: usize = 3;
const MIN_TABLE_COLS: usize = 2;

/// Finds runs of consecutive lines in physical-layout text whose cells are
/// separated by wide gaps, and turns each run into a table.
pub fn detect_aligned_tables(text: &str) -> Vec<TableGrid> {
    let mut tables = Vec::new();
    let mut run: Vec<Vec<String>> = Vec::new();

    for line in text.lines() {
        let cells = split_columns(line);
        if cells.len() >= MIN_TABLE_COLS {
            run.push(cells);
            continue;
        }
        flush_run(&mut run, &mut tables);
    }
    flush_run(&mut run, &mut tables);

    tables
}

fn split_columns(line: &str) -> Vec<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    COLUMN_GAP_RE
        .split(trimmed)
        .map(|cell| cell.trim().to_string())
        .filter(|cell| !cell.is_empty())
        .collect()
}

fn flush_run(run: &mut Vec<Vec<String>>, tables: &mut Vec<TableGrid>) {
    if run.len() >= MIN_TABLE_ROWS {
        tables.push(TableGrid::from_rows(std::mem::take(run)));
    } else {
        run.clear();
    }
}
