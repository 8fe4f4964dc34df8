//! Bookmark outline: read the tree from pdfium and flatten it.
//!
//! The outline is read once into owned [`OutlineEntry`] values so planning
//! ([`super::segment::plan_segments`]) is a pure function testable without
//! pdfium or a real document.

use crate::error::PipelineError;
use crate::pdf::{bind_pdfium, open_document};
use pdfium_render::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;
use tracing::{debug, warn};

/// Upper bound on bookmarks read from one document. Malformed outlines can
/// link siblings into a cycle; this stops the walk.
const MAX_OUTLINE_ENTRIES: usize = 100_000;

/// Nesting levels read below the root. Deeper children are skipped, which
/// also bounds a `first_child` chain that loops back on itself.
const MAX_OUTLINE_DEPTH: usize = 32;

/// One bookmark and its children, in document order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineEntry {
    pub title: String,
    /// 1-based target page; `None` when the bookmark has no resolvable destination.
    pub page: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<OutlineEntry>,
}

impl OutlineEntry {
    pub fn new(title: impl Into<String>, page: Option<usize>) -> Self {
        Self {
            title: title.into(),
            page,
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<OutlineEntry>) -> Self {
        self.children = children;
        self
    }
}

/// A flattened outline entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutlinePoint {
    pub title: String,
    pub page: Option<usize>,
    pub depth: usize,
}

/// Depth-first, document-order flattening of an outline tree.
pub fn flatten(entries: &[OutlineEntry]) -> Vec<OutlinePoint> {
    fn walk(entries: &[OutlineEntry], depth: usize, out: &mut Vec<OutlinePoint>) {
        for e in entries {
            out.push(OutlinePoint {
                title: e.title.clone(),
                page: e.page,
                depth,
            });
            walk(&e.children, depth + 1, out);
        }
    }

    let mut out = Vec::new();
    walk(entries, 0, &mut out);
    out
}

/// A source document's page count and outline, as shown by `--inspect-only`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentOutline {
    pub total_pages: usize,
    pub entries: Vec<OutlineEntry>,
}

impl DocumentOutline {
    /// Indented text rendering, one bookmark per line.
    pub fn render(&self) -> String {
        let mut out = format!("{} pages\n", self.total_pages);
        for point in flatten(&self.entries) {
            let page = point
                .page
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(out, "{}{:>5}  {}", "  ".repeat(point.depth), page, point.title);
        }
        out
    }
}

/// Read the outline and page count of a PDF.
///
/// Blocking: call from `spawn_blocking`.
pub fn read_outline(path: &Path) -> Result<DocumentOutline, PipelineError> {
    let pdfium = bind_pdfium()?;
    let document = open_document(&pdfium, path)?;
    let total_pages = document.pages().len() as usize;

    let mut budget = MAX_OUTLINE_ENTRIES;
    let mut too_deep = false;
    let entries = walk_bookmarks(document.bookmarks().root(), &mut budget, &mut too_deep);
    if budget == 0 {
        warn!(
            "Outline of {} truncated after {} entries",
            path.display(),
            MAX_OUTLINE_ENTRIES
        );
    }
    if too_deep {
        warn!(
            "Outline of {} nests deeper than {} levels; deeper entries skipped",
            path.display(),
            MAX_OUTLINE_DEPTH
        );
    }
    debug!(
        "Read outline of {}: {} top-level entries, {} pages",
        path.display(),
        entries.len(),
        total_pages
    );

    Ok(DocumentOutline {
        total_pages,
        entries,
    })
}

/// A node of a linked bookmark tree (first child, next sibling).
trait BookmarkNode: Sized {
    fn title(&self) -> String;
    /// 1-based target page, if the bookmark resolves to one.
    fn page(&self) -> Option<usize>;
    fn first_child(&self) -> Option<Self>;
    fn next_sibling(&self) -> Option<Self>;
}

impl<'a> BookmarkNode for PdfBookmark<'a> {
    fn title(&self) -> String {
        PdfBookmark::title(self).unwrap_or_default()
    }

    fn page(&self) -> Option<usize> {
        self.destination()
            .and_then(|d| d.page_index().ok())
            .map(|idx| idx as usize + 1)
    }

    fn first_child(&self) -> Option<Self> {
        PdfBookmark::first_child(self)
    }

    fn next_sibling(&self) -> Option<Self> {
        PdfBookmark::next_sibling(self)
    }
}

struct Level<N> {
    entries: Vec<OutlineEntry>,
    next: Option<N>,
    /// Title and page of the entry these are the children of.
    parent: Option<(String, Option<usize>)>,
}

/// Build the owned tree with an explicit stack, stopping at `budget` entries
/// and [`MAX_OUTLINE_DEPTH`] levels.
fn walk_bookmarks<N: BookmarkNode>(
    root: Option<N>,
    budget: &mut usize,
    too_deep: &mut bool,
) -> Vec<OutlineEntry> {
    let mut stack = vec![Level {
        entries: Vec::new(),
        next: root,
        parent: None,
    }];

    loop {
        let Some(level) = stack.last_mut() else {
            return Vec::new();
        };
        let node = if *budget > 0 { level.next.take() } else { None };

        let Some(node) = node else {
            let Some(done) = stack.pop() else {
                return Vec::new();
            };
            match (done.parent, stack.last_mut()) {
                (Some((title, page)), Some(up)) => up.entries.push(OutlineEntry {
                    title,
                    page,
                    children: done.entries,
                }),
                _ => return done.entries,
            }
            continue;
        };

        *budget -= 1;
        level.next = node.next_sibling();
        let title = node.title();
        let page = node.page();

        match node.first_child() {
            Some(child) if stack.len() <= MAX_OUTLINE_DEPTH => stack.push(Level {
                entries: Vec::new(),
                next: Some(child),
                parent: Some((title, page)),
            }),
            child => {
                *too_deep |= child.is_some();
                if let Some(level) = stack.last_mut() {
                    level.entries.push(OutlineEntry::new(title, page));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<OutlineEntry> {
        vec![
            OutlineEntry::new("Front Matter", Some(1)),
            OutlineEntry::new("A", Some(4)).with_children(vec![
                OutlineEntry::new("Emmy Noether", Some(6)),
                OutlineEntry::new("Unlinked", None),
            ]),
            OutlineEntry::new("Sofia Kovalevskaya", Some(40)),
        ]
    }

    #[test]
    fn flatten_is_depth_first() {
        let flat = flatten(&sample());
        let titles: Vec<&str> = flat.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(
            titles,
            ["Front Matter", "A", "Emmy Noether", "Unlinked", "Sofia Kovalevskaya"]
        );
        assert_eq!(flat[2].depth, 1);
        assert_eq!(flat[3].page, None);
    }

    #[test]
    fn render_indents_children() {
        let outline = DocumentOutline {
            total_pages: 60,
            entries: sample(),
        };
        let text = outline.render();
        assert!(text.starts_with("60 pages\n"));
        assert!(text.contains("      6  Emmy Noether"));
        assert!(text.contains("  -  Unlinked"));
    }

    /// Index-linked bookmarks, so malformed links can be expressed.
    struct Fake {
        title: &'static str,
        page: Option<usize>,
        child: Option<usize>,
        next: Option<usize>,
    }

    #[derive(Clone, Copy)]
    struct Node<'a> {
        all: &'a [Fake],
        at: usize,
    }

    impl<'a> Node<'a> {
        fn link(&self, to: Option<usize>) -> Option<Self> {
            to.map(|at| Node { all: self.all, at })
        }
    }

    impl<'a> BookmarkNode for Node<'a> {
        fn title(&self) -> String {
            self.all[self.at].title.to_string()
        }
        fn page(&self) -> Option<usize> {
            self.all[self.at].page
        }
        fn first_child(&self) -> Option<Self> {
            self.link(self.all[self.at].child)
        }
        fn next_sibling(&self) -> Option<Self> {
            self.link(self.all[self.at].next)
        }
    }

    fn fake(title: &'static str, page: usize, child: Option<usize>, next: Option<usize>) -> Fake {
        Fake {
            title,
            page: Some(page),
            child,
            next,
        }
    }

    fn walk(all: &[Fake]) -> (Vec<OutlineEntry>, usize, bool) {
        let mut budget = MAX_OUTLINE_ENTRIES;
        let mut too_deep = false;
        let entries = walk_bookmarks(Some(Node { all, at: 0 }), &mut budget, &mut too_deep);
        (entries, MAX_OUTLINE_ENTRIES - budget, too_deep)
    }

    #[test]
    fn walk_keeps_order_and_nesting() {
        let all = [
            fake("Front Matter", 1, None, Some(1)),
            fake("A", 4, Some(3), Some(2)),
            fake("Sofia Kovalevskaya", 40, None, None),
            fake("Emmy Noether", 6, None, Some(4)),
            Fake {
                title: "Unlinked",
                page: None,
                child: None,
                next: None,
            },
        ];
        let (entries, read, too_deep) = walk(&all);
        assert_eq!(entries, sample());
        assert_eq!(read, 5);
        assert!(!too_deep);
    }

    #[test]
    fn self_referencing_child_stops_at_depth_limit() {
        let all = [fake("Loop", 6, Some(0), None)];
        let (entries, read, too_deep) = walk(&all);
        assert!(too_deep);
        assert_eq!(read, MAX_OUTLINE_DEPTH + 1);
        assert_eq!(entries.len(), 1);
        let depth = flatten(&entries).iter().map(|p| p.depth).max().unwrap();
        assert_eq!(depth, MAX_OUTLINE_DEPTH);
    }

    #[test]
    fn sibling_cycle_stops_at_entry_budget() {
        let all = [fake("Ping", 6, None, Some(1)), fake("Pong", 7, None, Some(0))];
        let mut budget = 10;
        let mut too_deep = false;
        let entries = walk_bookmarks(Some(Node { all: &all, at: 0 }), &mut budget, &mut too_deep);
        assert_eq!(budget, 0);
        assert_eq!(entries.len(), 10);
    }

    #[test]
    fn deep_chain_does_not_exhaust_the_stack() {
        let all: Vec<Fake> = (0..50_000)
            .map(|i| fake("Nested Entry", 6, (i + 1 < 50_000).then_some(i + 1), None))
            .collect();
        let (entries, read, too_deep) = walk(&all);
        assert!(too_deep);
        assert_eq!(entries.len(), 1);
        assert_eq!(read, MAX_OUTLINE_DEPTH + 1);
    }

    #[test]
    fn empty_outline_walks_to_nothing() {
        let mut budget = 5;
        let mut too_deep = false;
        assert!(walk_bookmarks::<Node<'_>>(None, &mut budget, &mut too_deep).is_empty());
        assert_eq!(budget, 5);
    }
}
