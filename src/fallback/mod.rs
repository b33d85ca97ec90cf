use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;

use anyhow::{Result, bail};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::extract::{ExtractionTool, normalize_extraction};
use crate::model::{FallbackKind, PageRecord};
use crate::util::panic_message;

mod layout;
mod split;
mod table;

pub use layout::LayoutReorder;
pub use split::PageSplit;
pub use table::TableEnhancement;

/// A fallback that rewrites already-extracted pages.
pub trait PageTransform: Send + Sync {
    fn process(&self, pages: Vec<PageRecord>, source: &Path) -> Result<Vec<PageRecord>>;
}

/// A fallback that alters page geometry, so it must run before extraction:
/// the source is rewritten and the original tool extracts it again.
pub trait SourceRewrite: Send + Sync {
    fn rewrite(&self, source: &Path, page: &PageRecord) -> Result<RewrittenSource>;
}

/// Where each output page of a rewritten source sits on the original page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PieceOffset {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug)]
pub struct RewrittenSource {
    file: NamedTempFile,
    pieces: Vec<PieceOffset>,
}

impl RewrittenSource {
    pub fn new(file: NamedTempFile, pieces: Vec<PieceOffset>) -> Self {
        Self { file, pieces }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    #[cfg(test)]
    pub fn pieces(&self) -> &[PieceOffset] {
        &self.pieces
    }

    /// Folds the re-extracted pieces back into a single page in piece
    /// order, moving each piece's fragments into original page space.
    pub fn merge(&self, original: &PageRecord, pieces: Vec<PageRecord>) -> Result<PageRecord> {
        if pieces.len() != self.pieces.len() {
            bail!(
                "re-extraction returned {} pages for {} pieces",
                pieces.len(),
                self.pieces.len()
            );
        }

        let mut merged = PageRecord {
            page: original.page,
            width: original.width,
            height: original.height,
            ..PageRecord::default()
        };
        let mut texts = Vec::with_capacity(pieces.len());

        for (piece, offset) in pieces.into_iter().zip(&self.pieces) {
            let text = piece.text.trim();
            if !text.is_empty() {
                texts.push(text.to_string());
            }
            merged.bbox.extend(piece.bbox.into_iter().map(|mut fragment| {
                fragment.x0 += offset.x;
                fragment.x1 += offset.x;
                fragment.y0 += offset.y;
                fragment.y1 += offset.y;
                fragment
            }));
            merged.tables.extend(piece.tables);
        }

        merged.text = texts.join("\n");
        Ok(merged)
    }
}

pub enum FallbackTool {
    Transform(Box<dyn PageTransform>),
    Reextract(Box<dyn SourceRewrite>),
}

#[derive(Debug, Clone)]
pub enum CombinationOutcome {
    Applied(PageRecord),
    Skipped(String),
}

pub struct FallbackRegistry {
    tools: BTreeMap<FallbackKind, FallbackTool>,
}

impl Default for FallbackRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl FallbackRegistry {
    pub fn empty() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.insert(FallbackKind::PageSplit, FallbackTool::Reextract(Box::new(PageSplit::default())));
        registry.insert(FallbackKind::LayoutReorder, FallbackTool::Transform(Box::new(LayoutReorder)));
        registry.insert(FallbackKind::TableEnhancement, FallbackTool::Transform(Box::new(TableEnhancement)));
        registry
    }

    pub fn insert(&mut self, kind: FallbackKind, tool: FallbackTool) {
        self.tools.insert(kind, tool);
    }

    pub fn available(&self) -> Vec<FallbackKind> {
        self.tools.keys().copied().collect()
    }

    /// Applies one combination to a page. Source rewrites run first and are
    /// re-extracted with `extractor`, then page transforms run in combination
    /// order. Any failure skips the combination instead of surfacing an error.
    pub fn apply_combination(
        &self,
        combination: &[FallbackKind],
        page: &PageRecord,
        source: &Path,
        extractor: Option<&dyn ExtractionTool>,
    ) -> CombinationOutcome {
        match catch_unwind(AssertUnwindSafe(|| {
            self.try_apply(combination, page, source, extractor)
        })) {
            Ok(Ok(applied)) => CombinationOutcome::Applied(applied),
            Ok(Err(err)) => {
                debug!(error = %format!("{err:#}"), "fallback combination skipped");
                CombinationOutcome::Skipped(format!("{err:#}"))
            }
            Err(payload) => CombinationOutcome::Skipped(format!(
                "fallback panicked: {}",
                panic_message(payload.as_ref())
            )),
        }
    }

    fn try_apply(
        &self,
        combination: &[FallbackKind],
        page: &PageRecord,
        source: &Path,
        extractor: Option<&dyn ExtractionTool>,
    ) -> Result<PageRecord> {
        let mut rewrites = Vec::new();
        let mut transforms = Vec::new();
        for kind in combination {
            match self.tools.get(kind) {
                Some(FallbackTool::Reextract(tool)) => rewrites.push((*kind, tool)),
                Some(FallbackTool::Transform(tool)) => transforms.push((*kind, tool)),
                None => bail!("fallback tool {} is not available", kind),
            }
        }

        if rewrites.len() > 1 {
            bail!("only one source rewrite can run per combination");
        }

        let mut current = page.clone();

        if let Some((kind, tool)) = rewrites.first() {
            let Some(extractor) = extractor else {
                bail!("{} needs the original extraction tool, which is not registered", kind);
            };
            let rewritten = tool.rewrite(source, &current)?;
            let raw = extractor.extract(rewritten.path())?;
            let raw = normalize_extraction(extractor.name(), raw)?;
            current = rewritten.merge(&current, raw.pages)?;
            debug!(tool = %kind, extractor = %extractor.name(), page = current.page, "source rewritten and re-extracted");
        }

        for (kind, tool) in transforms {
            let mut pages = tool.process(vec![current], source)?;
            if pages.len() != 1 {
                bail!("{} returned {} pages for one input page", kind, pages.len());
            }
            current = pages.remove(0);
        }

        current.page = page.page;
        Ok(current)
    }
}
