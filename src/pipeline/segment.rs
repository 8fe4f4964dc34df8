//! Segmentation: turn the bookmark outline into one sub-document per subject.
//!
//! Planning ([`plan_segments`]) is pure and runs to completion before
//! anything touches the disk, so a duplicate key or an empty outline leaves
//! the previous `split/` directory untouched. Materialisation
//! ([`materialize`]) writes every sub-document into a staging directory next
//! to `split/` and swaps it in only after the last file is written.

use crate::cache::output_ref;
use crate::error::PipelineError;
use crate::output::OutputRef;
use crate::pdf::{bind_pdfium, open_document};
use crate::pipeline::outline::{flatten, OutlineEntry};
use once_cell::sync::Lazy;
use pdfium_render::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Name of the manifest written alongside the sub-documents.
pub const MANIFEST_FILE: &str = "segments.json";

/// One subject's page range in the source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectSegment {
    /// Normalised subject key, e.g. `noether_emmy`.
    pub key: String,
    /// Outline title the key was derived from.
    pub title: String,
    /// Inclusive, 1-based.
    pub first_page: usize,
    /// Inclusive, 1-based.
    pub last_page: usize,
    /// Sub-document path, set once materialised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl SubjectSegment {
    pub fn page_count(&self) -> usize {
        self.last_page + 1 - self.first_page
    }
}

/// Everything segmentation produced, persisted as `split/segments.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentManifest {
    pub source: PathBuf,
    pub total_pages: usize,
    pub start_page: usize,
    pub segments: Vec<SubjectSegment>,
}

impl SegmentManifest {
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let bytes = std::fs::read(path).map_err(|e| PipelineError::UpstreamUnreadable {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        serde_json::from_slice(&bytes).map_err(|e| PipelineError::UpstreamUnreadable {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
    }
}

// ── Title normalisation ──────────────────────────────────────────────────────

static RE_PARENTHESISED: Lazy<Regex> = Lazy::new(|| Regex::new(r"\([^)]*\)").unwrap());

/// Normalise an outline title into a subject key.
///
/// `"Noether, Amalie Emmy"` and `"Amalie Emmy Noether"` both become
/// `noether_amalie`. Returns `None` when nothing alphanumeric remains.
pub fn normalize_title(title: &str) -> Option<String> {
    let stripped = RE_PARENTHESISED.replace_all(title, " ");

    let words = |s: &str| -> Vec<String> {
        s.split_whitespace()
            .map(|w| {
                w.chars()
                    .filter_map(|c| match c {
                        '-' => Some('_'),
                        c if c.is_alphanumeric() => Some(c),
                        _ => None,
                    })
                    .flat_map(char::to_lowercase)
                    .collect::<String>()
                    .trim_matches('_')
                    .to_string()
            })
            .filter(|w| !w.is_empty())
            .collect()
    };

    // Surname plus the first given name; middle names are dropped.
    let ordered: Vec<String> = match stripped.split_once(',') {
        Some((last, rest)) => {
            let mut v = words(last);
            v.extend(words(&rest.replace(',', " ")).into_iter().take(1));
            v
        }
        None => {
            let mut v = words(&stripped);
            match v.pop() {
                Some(last) => {
                    v.truncate(1);
                    v.insert(0, last);
                    v
                }
                None => v,
            }
        }
    };

    if ordered.is_empty() {
        None
    } else {
        Some(ordered.join("_"))
    }
}

// ── Planning ─────────────────────────────────────────────────────────────────

struct Candidate {
    title: String,
    key: String,
    page: usize,
}

/// Plan subject page ranges from an outline.
///
/// Returns segments in page order. An empty result is not an error here; the
/// caller knows the source path and reports [`PipelineError::EmptyOutline`].
/// Two retained entries with the same key fail with
/// [`PipelineError::DuplicateSubject`].
pub fn plan_segments(
    outline: &[OutlineEntry],
    total_pages: usize,
    start_page: usize,
) -> Result<Vec<SubjectSegment>, PipelineError> {
    let start_page = start_page.max(1);
    let mut candidates: Vec<Candidate> = Vec::new();

    for point in flatten(outline) {
        let title = point.title.trim();
        let Some(page) = point.page else {
            debug!("Outline entry '{}' has no destination; skipped", title);
            continue;
        };
        if title.chars().count() <= 1 {
            debug!("Outline entry '{}' is a section divider; skipped", title);
            continue;
        }
        if page == 0 || page > total_pages {
            warn!(
                "Outline entry '{}' points at page {} of {}; skipped",
                title, page, total_pages
            );
            continue;
        }
        let Some(key) = normalize_title(title) else {
            warn!("Outline entry '{}' normalises to an empty key; skipped", title);
            continue;
        };
        candidates.push(Candidate {
            title: title.to_string(),
            key,
            page,
        });
    }

    // Stable: entries on the same page keep document order.
    candidates.sort_by_key(|c| c.page);

    let mut segments: Vec<SubjectSegment> = Vec::new();
    let mut seen: HashMap<String, String> = HashMap::new();

    for (i, c) in candidates.iter().enumerate() {
        let end = candidates
            .get(i + 1)
            .map(|next| next.page.saturating_sub(1))
            .unwrap_or(total_pages);
        if end < c.page {
            warn!(
                "Outline entry '{}' has an empty page range (next entry starts on page {}); skipped",
                c.title, c.page
            );
            continue;
        }
        if end < start_page {
            debug!(
                "Outline entry '{}' [{}, {}] precedes page {}; skipped",
                c.title, c.page, end, start_page
            );
            continue;
        }

        if let Some(first_title) = seen.get(&c.key) {
            return Err(PipelineError::DuplicateSubject {
                key: c.key.clone(),
                first_title: first_title.clone(),
                second_title: c.title.clone(),
            });
        }
        seen.insert(c.key.clone(), c.title.clone());

        segments.push(SubjectSegment {
            key: c.key.clone(),
            title: c.title.clone(),
            first_page: c.page.max(start_page),
            last_page: end,
            path: None,
        });
    }

    if let Some(first) = segments.first() {
        if first.first_page > start_page {
            warn!(
                "Pages {}..{} precede the first subject and belong to no segment",
                start_page,
                first.first_page - 1
            );
        }
    }

    Ok(segments)
}

// ── Materialisation ──────────────────────────────────────────────────────────

/// Write one PDF per segment plus the manifest, replacing `split_dir`.
///
/// Blocking: call from `spawn_blocking`. Returns the manifest (with paths
/// filled in) and an output reference for every file written, sub-documents
/// first and the manifest last.
pub fn materialize(
    source: &Path,
    total_pages: usize,
    start_page: usize,
    segments: Vec<SubjectSegment>,
    split_dir: &Path,
) -> Result<(SegmentManifest, Vec<OutputRef>), PipelineError> {
    let parent = split_dir.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|source| PipelineError::OutputWriteFailed {
        path: parent.to_path_buf(),
        source,
    })?;
    let staging = tempfile::Builder::new()
        .prefix(".split-staging-")
        .tempdir_in(parent)
        .map_err(|source| PipelineError::OutputWriteFailed {
            path: parent.to_path_buf(),
            source,
        })?;

    let pdfium = bind_pdfium()?;
    let source_doc = open_document(&pdfium, source)?;

    let mut outputs = Vec::with_capacity(segments.len() + 1);
    let mut placed = Vec::with_capacity(segments.len());

    for mut seg in segments {
        let file_name = format!("{}.pdf", seg.key);
        let staged = staging.path().join(&file_name);
        let split_err = |detail: String| PipelineError::SplitFailed {
            key: seg.key.clone(),
            detail,
        };

        let mut doc = pdfium
            .create_new_pdf()
            .map_err(|e| split_err(format!("{e:?}")))?;
        doc.pages_mut()
            .copy_page_range_from_document(
                &source_doc,
                (seg.first_page - 1) as PdfPageIndex..=(seg.last_page - 1) as PdfPageIndex,
                0,
            )
            .map_err(|e| split_err(format!("{e:?}")))?;
        doc.save_to_file(&staged)
            .map_err(|e| split_err(format!("{e:?}")))?;

        let bytes = std::fs::read(&staged).map_err(|e| split_err(e.to_string()))?;
        let final_path = split_dir.join(&file_name);
        outputs.push(output_ref(seg.key.clone(), &final_path, &bytes));
        debug!(
            "Wrote {} (pages {}-{})",
            file_name, seg.first_page, seg.last_page
        );

        seg.path = Some(final_path);
        placed.push(seg);
    }

    let manifest = SegmentManifest {
        source: source.to_path_buf(),
        total_pages,
        start_page,
        segments: placed,
    };
    let json = serde_json::to_vec_pretty(&manifest)
        .map_err(|e| PipelineError::Internal(format!("manifest serialisation: {e}")))?;
    let staged_manifest = staging.path().join(MANIFEST_FILE);
    std::fs::write(&staged_manifest, &json).map_err(|source| {
        PipelineError::OutputWriteFailed {
            path: staged_manifest.clone(),
            source,
        }
    })?;
    outputs.push(output_ref(MANIFEST_FILE, &split_dir.join(MANIFEST_FILE), &json));

    swap_into_place(staging.path(), split_dir)?;
    info!(
        "Split {} into {} sub-documents",
        source.display(),
        manifest.segments.len()
    );
    Ok((manifest, outputs))
}

/// Replace `target` with the fully written `staged` directory.
fn swap_into_place(staged: &Path, target: &Path) -> Result<(), PipelineError> {
    let io_err = |source: std::io::Error| PipelineError::OutputWriteFailed {
        path: target.to_path_buf(),
        source,
    };

    let backup = target.with_extension(format!("old-{}", std::process::id()));
    let had_previous = target.exists();
    if had_previous {
        std::fs::rename(target, &backup).map_err(io_err)?;
    }
    if let Err(e) = std::fs::rename(staged, target) {
        if had_previous {
            let _ = std::fs::rename(&backup, target);
        }
        return Err(io_err(e));
    }
    if had_previous {
        if let Err(e) = std::fs::remove_dir_all(&backup) {
            warn!("Could not remove previous split directory {}: {}", backup.display(), e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(title: &str, page: usize) -> OutlineEntry {
        OutlineEntry::new(title, Some(page))
    }

    #[test]
    fn normalises_both_name_orders() {
        assert_eq!(normalize_title("Noether, Emmy").as_deref(), Some("noether_emmy"));
        assert_eq!(normalize_title("Emmy Noether").as_deref(), Some("noether_emmy"));
        assert_eq!(normalize_title("Mary Ellen Rudin").as_deref(), Some("rudin_mary"));
        assert_eq!(
            normalize_title("RUDIN, Mary Ellen (1924–2013)").as_deref(),
            Some("rudin_mary")
        );
        assert_eq!(
            normalize_title("NOETHER, Amalie Emmy").as_deref(),
            Some("noether_amalie")
        );
    }

    #[test]
    fn middle_names_are_dropped_so_keys_can_collide() {
        let outline = vec![entry("Rudin, Mary Ellen", 6), entry("Rudin, Mary Jane", 20)];
        match plan_segments(&outline, 30, 6).unwrap_err() {
            PipelineError::DuplicateSubject { key, .. } => assert_eq!(key, "rudin_mary"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn normalisation_drops_apostrophes_and_punctuation() {
        assert_eq!(normalize_title("Mary O'Brien").as_deref(), Some("obrien_mary"));
        assert_eq!(normalize_title("E. H. Moore").as_deref(), Some("moore_e"));
        assert_eq!(
            normalize_title("Sofia Kovalevskaya-Smith").as_deref(),
            Some("kovalevskaya_smith_sofia")
        );
        assert_eq!(normalize_title(" -- ... "), None);
        assert_eq!(normalize_title("(Appendix)"), None);
    }

    #[test]
    fn plans_book_example() {
        let outline = vec![
            entry("Front Matter", 1),
            entry("A", 4),
            entry("Emmy Noether", 6),
            entry("Sofia Kovalevskaya", 40),
        ];
        let segs = plan_segments(&outline, 75, 6).unwrap();
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].key, "noether_emmy");
        assert_eq!((segs[0].first_page, segs[0].last_page), (6, 39));
        assert_eq!(segs[1].key, "kovalevskaya_sofia");
        assert_eq!((segs[1].first_page, segs[1].last_page), (40, 75));
    }

    #[test]
    fn single_character_titles_are_never_emitted() {
        let outline = vec![
            entry("A", 6).with_children(vec![entry("Ada Lovelace", 6)]),
            entry("B", 10).with_children(vec![entry("Nina Bari", 11)]),
        ];
        let segs = plan_segments(&outline, 20, 6).unwrap();
        let keys: Vec<&str> = segs.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, ["lovelace_ada", "bari_nina"]);
        // "B" is not a boundary: page 10 rolls into the previous subject.
        assert_eq!((segs[0].first_page, segs[0].last_page), (6, 10));
        assert_eq!((segs[1].first_page, segs[1].last_page), (11, 20));
    }

    #[test]
    fn straddling_range_is_clipped() {
        let outline = vec![entry("Introduction Essay", 3), entry("Emmy Noether", 8)];
        let segs = plan_segments(&outline, 12, 6).unwrap();
        assert_eq!((segs[0].first_page, segs[0].last_page), (6, 7));
        assert_eq!(segs[1].first_page, 8);
    }

    #[test]
    fn ranges_are_disjoint_and_ordered() {
        let outline = vec![
            entry("Olga Taussky", 30),
            entry("Emmy Noether", 6),
            OutlineEntry::new("Broken Link", None),
            entry("Past The End", 999),
            entry("Julia Robinson", 18),
        ];
        let segs = plan_segments(&outline, 50, 6).unwrap();
        let ranges: Vec<(usize, usize)> = segs.iter().map(|s| (s.first_page, s.last_page)).collect();
        assert_eq!(ranges, [(6, 17), (18, 29), (30, 50)]);
        for pair in segs.windows(2) {
            assert_eq!(pair[0].last_page + 1, pair[1].first_page);
        }
    }

    #[test]
    fn same_page_entries_drop_the_empty_one() {
        let outline = vec![entry("Part One Title", 6), entry("Emmy Noether", 6)];
        let segs = plan_segments(&outline, 10, 6).unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].key, "noether_emmy");
    }

    #[test]
    fn duplicate_keys_fail() {
        let outline = vec![entry("Noether, Emmy", 6), entry("Emmy Noether", 20)];
        match plan_segments(&outline, 30, 6).unwrap_err() {
            PipelineError::DuplicateSubject { key, .. } => assert_eq!(key, "noether_emmy"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn nothing_retained_plans_nothing() {
        let outline = vec![entry("A", 6), entry("Preface Notes", 2)];
        assert!(plan_segments(&outline, 5, 6).unwrap().is_empty());
    }

    #[test]
    fn manifest_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = SegmentManifest {
            source: PathBuf::from("book.pdf"),
            total_pages: 75,
            start_page: 6,
            segments: vec![SubjectSegment {
                key: "noether_emmy".into(),
                title: "Emmy Noether".into(),
                first_page: 6,
                last_page: 39,
                path: Some(dir.path().join("noether_emmy.pdf")),
            }],
        };
        let path = dir.path().join(MANIFEST_FILE);
        std::fs::write(&path, serde_json::to_vec(&manifest).unwrap()).unwrap();
        assert_eq!(SegmentManifest::load(&path).unwrap(), manifest);
        assert_eq!(manifest.segments[0].page_count(), 34);
    }

    #[test]
    fn swap_replaces_previous_directory() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("split");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("stale.pdf"), b"old").unwrap();
        let staged = root.path().join("staged");
        std::fs::create_dir_all(&staged).unwrap();
        std::fs::write(staged.join("fresh.pdf"), b"new").unwrap();

        swap_into_place(&staged, &target).unwrap();
        assert!(target.join("fresh.pdf").exists());
        assert!(!target.join("stale.pdf").exists());
        assert!(!staged.exists());
    }
}
