use std::path::Path;

use anyhow::Result;

use super::PageTransform;
use crate::model::{PageRecord, TextFragment};

const LINE_TOLERANCE: f64 = 3.0;

/// Two-column reading order: fragments left of the page midline come first,
/// then the right column, each read top to bottom.
pub struct LayoutReorder;

impl PageTransform for LayoutReorder {
    fn process(&self, pages: Vec<PageRecord>, _source: &Path) -> Result<Vec<PageRecord>> {
        Ok(pages.into_iter().map(reorder_page).collect())
    }
}

fn reorder_page(mut page: PageRecord) -> PageRecord {
    if page.bbox.is_empty() {
        return page;
    }

    let midline = page_width(&page) / 2.0;
    let (mut left, mut right): (Vec<TextFragment>, Vec<TextFragment>) = std::mem::take(&mut page.bbox)
        .into_iter()
        .partition(|fragment| fragment.x_center() < midline);

    let columns = if left.is_empty() || right.is_empty() {
        left.append(&mut right);
        vec![left]
    } else {
        vec![left, right]
    };

    let mut lines = Vec::new();
    for mut column in columns {
        column.sort_by(|a, b| a.y0.total_cmp(&b.y0).then(a.x0.total_cmp(&b.x0)));
        lines.extend(column_lines(&column));
        page.bbox.extend(column);
    }

    page.text = lines.join("\n");
    page
}

fn page_width(page: &PageRecord) -> f64 {
    if page.width > 0.0 {
        return page.width;
    }
    page.bbox
        .iter()
        .map(|fragment| fragment.x1)
        .fold(0.0, f64::max)
}

fn column_lines(column: &[TextFragment]) -> Vec<String> {
    let mut lines: Vec<(f64, Vec<&str>)> = Vec::new();
    for fragment in column {
        match lines.last_mut() {
            Some((top, words)) if (fragment.y0 - *top).abs() <= LINE_TOLERANCE => {
                words.push(&fragment.text);
            }
            _ => lines.push((fragment.y0, vec![fragment.text.as_str()])),
        }
    }
    lines.into_iter().map(|(_, words)| words.join(" ")).collect()
}
