//! Text extraction: one transcript per sub-document, page order preserved.
//!
//! The stage is total. A page whose text layer cannot be read becomes an
//! empty page, and a sub-document that cannot be opened becomes a transcript
//! of empty pages, so downstream stages always see one transcript per
//! segment.

use crate::pdf::open_document;
use crate::pipeline::segment::SubjectSegment;
use pdfium_render::prelude::*;
use std::path::Path;
use tracing::warn;

/// Separates pages in a persisted transcript.
pub const PAGE_SEPARATOR: char = '\x0c';

/// Source of per-page text for a document.
pub trait TextLayer {
    /// Text of every page in order. The outer `Err` means the document could
    /// not be opened; an inner `Err` means that one page failed.
    fn page_texts(&self, path: &Path) -> Result<Vec<Result<String, String>>, String>;
}

/// Reads the embedded text layer through pdfium.
pub struct PdfiumTextLayer<'a> {
    pdfium: &'a Pdfium,
}

impl<'a> PdfiumTextLayer<'a> {
    pub fn new(pdfium: &'a Pdfium) -> Self {
        Self { pdfium }
    }
}

impl TextLayer for PdfiumTextLayer<'_> {
    fn page_texts(&self, path: &Path) -> Result<Vec<Result<String, String>>, String> {
        let document = open_document(self.pdfium, path).map_err(|e| e.to_string())?;
        Ok(document
            .pages()
            .iter()
            .map(|page| {
                page.text()
                    .map(|t| t.all())
                    .map_err(|e| format!("{e:?}"))
            })
            .collect())
    }
}

/// One subject's text, a page at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub key: String,
    pub pages: Vec<String>,
}

impl Transcript {
    /// Concatenated form with pages separated by form feeds.
    pub fn to_text(&self) -> String {
        self.pages.join(&PAGE_SEPARATOR.to_string())
    }

    /// Inverse of [`Transcript::to_text`].
    pub fn from_text(key: impl Into<String>, text: &str) -> Self {
        Self {
            key: key.into(),
            pages: text.split(PAGE_SEPARATOR).map(str::to_string).collect(),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.pages.iter().all(|p| p.trim().is_empty())
    }
}

/// Extract a segment's transcript. Returns the transcript and the number of
/// pages that degraded to empty.
pub fn build_transcript(layer: &dyn TextLayer, segment: &SubjectSegment) -> (Transcript, usize) {
    let blank = |n: usize| Transcript {
        key: segment.key.clone(),
        pages: vec![String::new(); n],
    };

    let Some(path) = segment.path.as_deref() else {
        warn!("{}: no sub-document recorded; transcript left empty", segment.key);
        return (blank(segment.page_count()), segment.page_count());
    };

    let pages = match layer.page_texts(path) {
        Ok(pages) => pages,
        Err(e) => {
            warn!("{}: cannot open {}: {}", segment.key, path.display(), e);
            return (blank(segment.page_count()), segment.page_count());
        }
    };

    let mut empty = 0;
    let pages = pages
        .into_iter()
        .enumerate()
        .map(|(i, page)| match page {
            Ok(text) => clean_page(&text),
            Err(e) => {
                warn!("{}: page {} text unreadable: {}", segment.key, i + 1, e);
                empty += 1;
                String::new()
            }
        })
        .collect();

    (
        Transcript {
            key: segment.key.clone(),
            pages,
        },
        empty,
    )
}

fn clean_page(text: &str) -> String {
    text.replace("\r\n", "\n")
        .replace(['\r', PAGE_SEPARATOR], "\n")
        .trim_end()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct FakeLayer(Result<Vec<Result<String, String>>, String>);

    impl TextLayer for FakeLayer {
        fn page_texts(&self, _path: &Path) -> Result<Vec<Result<String, String>>, String> {
            self.0.clone()
        }
    }

    fn segment(pages: usize) -> SubjectSegment {
        SubjectSegment {
            key: "noether_emmy".into(),
            title: "Emmy Noether".into(),
            first_page: 6,
            last_page: 5 + pages,
            path: Some(PathBuf::from("split/noether_emmy.pdf")),
        }
    }

    #[test]
    fn pages_keep_order() {
        let layer = FakeLayer(Ok(vec![Ok("born 1882\r\n".into()), Ok("died 1935".into())]));
        let (t, empty) = build_transcript(&layer, &segment(2));
        assert_eq!(t.pages, ["born 1882", "died 1935"]);
        assert_eq!(empty, 0);
    }

    #[test]
    fn unreadable_page_becomes_empty() {
        let layer = FakeLayer(Ok(vec![Ok("one".into()), Err("bad text object".into()), Ok("three".into())]));
        let (t, empty) = build_transcript(&layer, &segment(3));
        assert_eq!(t.pages, ["one", "", "three"]);
        assert_eq!(empty, 1);
    }

    #[test]
    fn unopenable_document_yields_empty_pages() {
        let layer = FakeLayer(Err("corrupt".into()));
        let (t, empty) = build_transcript(&layer, &segment(4));
        assert_eq!(t.pages.len(), 4);
        assert!(t.is_blank());
        assert_eq!(empty, 4);
    }

    #[test]
    fn form_feeds_separate_pages() {
        let t = Transcript {
            key: "k".into(),
            pages: vec!["a\nb".into(), "".into(), "c".into()],
        };
        let text = t.to_text();
        assert_eq!(text, "a\nb\x0c\x0cc");
        assert_eq!(Transcript::from_text("k", &text), t);
    }

    #[test]
    fn embedded_form_feed_cannot_split_a_page() {
        let layer = FakeLayer(Ok(vec![Ok("a\x0cb".into())]));
        let (t, _) = build_transcript(&layer, &segment(1));
        assert_eq!(Transcript::from_text("noether_emmy", &t.to_text()).pages.len(), 1);
    }
}
