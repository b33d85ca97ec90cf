use std::path::Path;

use anyhow::Result;

use super::PageTransform;
use crate::model::{PageRecord, TableGrid};

/// Repairs table structure: recovers `|` or tab separated tables from the
/// text when none were detected, then strips thousands separators and fills
/// empty (merged) cells from their left neighbour.
pub struct TableEnhancement;

impl PageTransform for TableEnhancement {
    fn process(&self, pages: Vec<PageRecord>, _source: &Path) -> Result<Vec<PageRecord>> {
        Ok(pages.into_iter().map(enhance_page).collect())
    }
}

fn enhance_page(mut page: PageRecord) -> PageRecord {
    if page.tables.is_empty() {
        page.tables = detect_delimited_tables(&page.text);
    }

    page.tables = std::mem::take(&mut page.tables)
        .into_iter()
        .map(|table| TableGrid::from_rows(fill_merged_cells(normalize_numbers(table.data))))
        .collect();
    page
}

pub(crate) fn detect_delimited_tables(text: &str) -> Vec<TableGrid> {
    let mut tables = Vec::new();
    let mut current: Vec<Vec<String>> = Vec::new();

    for line in text.split('\n') {
        let delimiter = if line.contains('|') {
            Some('|')
        } else if line.contains('\t') {
            Some('\t')
        } else {
            None
        };

        match delimiter {
            Some(delimiter) => {
                let cells = line
                    .split(delimiter)
                    .map(str::trim)
                    .filter(|cell| !cell.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<String>>();
                if cells.len() >= 2 {
                    current.push(cells);
                }
            }
            None => {
                if current.len() >= 2 {
                    tables.push(TableGrid::from_rows(std::mem::take(&mut current)));
                }
                current.clear();
            }
        }
    }

    if current.len() >= 2 {
        tables.push(TableGrid::from_rows(current));
    }
    tables
}

fn normalize_numbers(data: Vec<Vec<String>>) -> Vec<Vec<String>> {
    data.into_iter()
        .map(|row| {
            row.into_iter()
                .map(|cell| cell.replace(',', "").trim().to_string())
                .collect()
        })
        .collect()
}

fn fill_merged_cells(data: Vec<Vec<String>>) -> Vec<Vec<String>> {
    data.into_iter()
        .map(|row| {
            let mut previous = String::new();
            row.into_iter()
                .map(|cell| {
                    if cell.trim().is_empty() {
                        previous.clone()
                    } else {
                        previous = cell.clone();
                        cell
                    }
                })
                .collect()
        })
        .collect()
}
