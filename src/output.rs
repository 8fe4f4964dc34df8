//! Stage outcome types shared by the driver, the cache and the CLI.

use crate::error::SubjectError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// The four pipeline stages, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Segment,
    ExtractText,
    ExtractStructure,
    Normalize,
}

impl StageName {
    /// Stable identifier used in cache keys and directory names.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Segment => "segment",
            StageName::ExtractText => "extract_text",
            StageName::ExtractStructure => "extract_structure",
            StageName::Normalize => "normalize",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted output file and the digest of its content at write time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRef {
    /// Logical name: a subject key, a table name, or a manifest name.
    pub name: String,
    pub path: PathBuf,
    /// BLAKE3 hex digest of the file content.
    pub digest: String,
}

/// What a stage returns to its caller (driver or external orchestrator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: StageName,
    pub code_version: String,
    /// Fingerprint of the upstream inputs this run consumed.
    pub fingerprint: String,
    /// True when the whole stage was served from the cache.
    pub cached: bool,
    /// Output files, sorted by name.
    pub outputs: Vec<OutputRef>,
    /// Work items the stage attempted.
    pub total_items: usize,
    /// Work items that produced output.
    pub succeeded: usize,
    /// Extra per-stage counters (pages, rows per table, cache hits...).
    pub counts: BTreeMap<String, usize>,
    /// Per-item failures; never fatal to the stage.
    pub failures: Vec<SubjectError>,
    pub duration_ms: u64,
}

impl StageReport {
    /// Human summary line, e.g. `extract_structure: 41/45 subjects succeeded`.
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{}: {}/{} subjects succeeded",
            self.stage, self.succeeded, self.total_items
        );
        if self.cached {
            line.push_str(" (cached)");
        }
        line
    }

    /// Look up a counter, defaulting to zero.
    pub fn count(&self, key: &str) -> usize {
        self.counts.get(key).copied().unwrap_or(0)
    }
}

/// Reports for a full four-stage run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub stages: Vec<StageReport>,
    pub total_duration_ms: u64,
}

impl PipelineReport {
    /// Every per-subject failure across all stages.
    pub fn failures(&self) -> impl Iterator<Item = &SubjectError> {
        self.stages.iter().flat_map(|s| s.failures.iter())
    }

    pub fn stage(&self, name: StageName) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == name)
    }
}
