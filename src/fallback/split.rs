use std::path::Path;

use anyhow::{Context, Result, anyhow};
use lopdf::{Dictionary, Document, Object, ObjectId};

use super::{PieceOffset, RewrittenSource, SourceRewrite};
use crate::model::PageRecord;

const DEFAULT_OVERLAP: f64 = 10.0;
const LETTER_BOX: [f64; 4] = [0.0, 0.0, 612.0, 792.0];
const MAX_TREE_DEPTH: usize = 32;

/// Cuts a page into left and right halves so a double-page spread is
/// extracted as two single pages.
pub struct PageSplit {
    overlap: f64,
}

impl Default for PageSplit {
    fn default() -> Self {
        Self::with_overlap(DEFAULT_OVERLAP)
    }
}

impl PageSplit {
    pub fn with_overlap(overlap: f64) -> Self {
        Self {
            overlap: overlap.max(0.0),
        }
    }
}

impl SourceRewrite for PageSplit {
    fn rewrite(&self, source: &Path, page: &PageRecord) -> Result<RewrittenSource> {
        let mut document = Document::load(source)
            .with_context(|| format!("failed to load {} for page split", source.display()))?;

        let page_id = *document
            .get_pages()
            .get(&page.page)
            .ok_or_else(|| anyhow!("page {} not found in {}", page.page, source.display()))?;

        let media_box = inherited(&document, page_id, b"MediaBox")
            .and_then(|object| rect(&document, object))
            .unwrap_or(LETTER_BOX);
        let resources = inherited(&document, page_id, b"Resources").cloned();
        let rotate = inherited(&document, page_id, b"Rotate").cloned();
        let page_dict = document
            .get_dictionary(page_id)
            .context("page object is not a dictionary")?
            .clone();

        let [x0, y0, x1, y1] = media_box;
        let middle = x0 + (x1 - x0) / 2.0;
        let overlap = self.overlap.min((x1 - x0) / 2.0);
        let left_box = [x0, y0, middle + overlap, y1];
        let right_box = [middle - overlap, y0, x1, y1];

        let pages_id = document
            .trailer
            .get(b"Root")
            .and_then(Object::as_reference)
            .and_then(|root| document.get_dictionary(root))
            .and_then(|catalog| catalog.get(b"Pages"))
            .and_then(Object::as_reference)
            .context("document has no page tree root")?;

        let left_id = document.add_object(half_page(&page_dict, pages_id, left_box, &resources, &rotate));
        let right_id = document.add_object(half_page(&page_dict, pages_id, right_box, &resources, &rotate));

        let pages_root = document
            .get_dictionary_mut(pages_id)
            .context("page tree root is not a dictionary")?;
        pages_root.set("Kids", vec![Object::Reference(left_id), Object::Reference(right_id)]);
        pages_root.set("Count", 2_i64);

        let mut file = tempfile::Builder::new()
            .prefix("docbench-split-")
            .suffix(".pdf")
            .tempfile()
            .context("failed to create split page file")?;
        document
            .save_to(&mut file)
            .context("failed to write split page file")?;

        Ok(RewrittenSource::new(
            file,
            vec![
                PieceOffset { x: 0.0, y: 0.0 },
                PieceOffset {
                    x: right_box[0] - x0,
                    y: 0.0,
                },
            ],
        ))
    }
}

fn half_page(
    original: &Dictionary,
    parent: ObjectId,
    bounds: [f64; 4],
    resources: &Option<Object>,
    rotate: &Option<Object>,
) -> Dictionary {
    let mut dict = original.clone();
    let bounds = bounds
        .iter()
        .map(|value| Object::Real(*value as f32))
        .collect::<Vec<Object>>();

    dict.set("Parent", Object::Reference(parent));
    dict.set("MediaBox", bounds.clone());
    dict.set("CropBox", bounds);
    if let Some(resources) = resources {
        dict.set("Resources", resources.clone());
    }
    if let Some(rotate) = rotate {
        dict.set("Rotate", rotate.clone());
    }
    dict
}

/// Looks a key up on the page and then up the `Parent` chain, the way
/// inheritable page attributes resolve.
fn inherited<'a>(document: &'a Document, page_id: ObjectId, key: &[u8]) -> Option<&'a Object> {
    let mut current = document.get_dictionary(page_id).ok()?;
    for _ in 0..MAX_TREE_DEPTH {
        if let Ok(value) = current.get(key) {
            return Some(value);
        }
        let parent = current.get(b"Parent").and_then(Object::as_reference).ok()?;
        current = document.get_dictionary(parent).ok()?;
    }
    None
}

fn resolve<'a>(document: &'a Document, object: &'a Object) -> &'a Object {
    match object {
        Object::Reference(id) => document.get_object(*id).unwrap_or(object),
        other => other,
    }
}

fn number(object: &Object) -> Option<f64> {
    match object {
        Object::Integer(value) => Some(*value as f64),
        Object::Real(value) => Some(*value as f64),
        _ => None,
    }
}

fn rect(document: &Document, object: &Object) -> Option<[f64; 4]> {
    let Object::Array(items) = resolve(document, object) else {
        return None;
    };
    if items.len() != 4 {
        return None;
    }

    let values = items
        .iter()
        .map(|item| number(resolve(document, item)))
        .collect::<Option<Vec<f64>>>()?;
    let (x0, x1) = (values[0].min(values[2]), values[0].max(values[2]));
    let (y0, y1) = (values[1].min(values[3]), values[1].max(values[3]));
    (x1 > x0 && y1 > y0).then_some([x0, y0, x1, y1])
}

#[cfg(test)]
mod tests {
    use lopdf::dictionary;

    use super::*;

    fn two_page_pdf(dir: &Path) -> std::path::PathBuf {
        let mut document = Document::with_version("1.5");
        let pages_id = document.new_object_id();
        let first = document.add_object(dictionary! { "Type" => "Page", "Parent" => pages_id });
        let second = document.add_object(dictionary! { "Type" => "Page", "Parent" => pages_id });
        document.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![first.into(), second.into()],
                "Count" => 2,
                "MediaBox" => vec![0.into(), 0.into(), 800.into(), 600.into()],
            }),
        );
        let catalog_id = document.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        document.trailer.set("Root", catalog_id);

        let path = dir.join("spread.pdf");
        document.save(&path).unwrap();
        path
    }

    #[test]
    fn split_produces_two_overlapping_halves_of_the_target_page() {
        let dir = tempfile::tempdir().unwrap();
        let source = two_page_pdf(dir.path());
        let page = PageRecord {
            page: 2,
            ..PageRecord::default()
        };

        let rewritten = PageSplit::default().rewrite(&source, &page).unwrap();
        let output = Document::load(rewritten.path()).unwrap();
        let pages = output.get_pages();
        assert_eq!(pages.len(), 2);

        let boxes = pages
            .values()
            .map(|id| {
                let dict = output.get_dictionary(*id).unwrap();
                rect(&output, dict.get(b"MediaBox").unwrap()).unwrap()
            })
            .collect::<Vec<[f64; 4]>>();
        assert_eq!(boxes[0], [0.0, 0.0, 410.0, 600.0]);
        assert_eq!(boxes[1], [390.0, 0.0, 800.0, 600.0]);
        assert_eq!(rewritten.pieces()[1], PieceOffset { x: 390.0, y: 0.0 });
    }

    #[test]
    fn missing_page_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = two_page_pdf(dir.path());
        let page = PageRecord {
            page: 7,
            ..PageRecord::default()
        };
        assert!(PageSplit::with_overlap(5.0).rewrite(&source, &page).is_err());
    }
}
