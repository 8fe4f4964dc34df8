//! On-disk memoization of stage outputs.
//!
//! An entry is keyed by `(stage, code version, upstream fingerprint)` and
//! records the output files the stage produced together with a BLAKE3 digest
//! of each. Entries never expire: a stage reruns only when its code version is
//! bumped or its upstream content changes, so expensive completion calls are
//! neither silently repeated nor silently stale.
//!
//! A lookup only hits when the entry parses, its key matches, and every
//! referenced output still exists with the recorded digest. Anything else is
//! a miss and the stage simply recomputes.
//!
//! Layout: `<root>/<stage>/<entry-id>.json`, where `entry-id` is the BLAKE3
//! digest of the key. Entry files are written with temp-file + rename, and
//! always after the outputs they reference, so an aborted run never leaves a
//! torn entry behind.

use crate::error::PipelineError;
use crate::output::OutputRef;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Identity of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub stage: String,
    pub code_version: String,
    pub fingerprint: String,
}

impl CacheKey {
    pub fn new(
        stage: impl Into<String>,
        code_version: impl Into<String>,
        fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            stage: stage.into(),
            code_version: code_version.into(),
            fingerprint: fingerprint.into(),
        }
    }

    /// File-system safe identifier for this key.
    pub fn entry_id(&self) -> String {
        let mut fp = Fingerprinter::new("cache-key");
        fp.part("stage", self.stage.as_bytes())
            .part("code_version", self.code_version.as_bytes())
            .part("fingerprint", self.fingerprint.as_bytes());
        fp.finish()
    }
}

/// A stored stage result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub outputs: Vec<OutputRef>,
    pub counts: BTreeMap<String, usize>,
    pub created_at: DateTime<Utc>,
}

/// Builds a stable fingerprint over named, length-prefixed parts.
///
/// Length prefixes keep `("ab", "c")` and `("a", "bc")` distinct.
pub struct Fingerprinter {
    hasher: blake3::Hasher,
}

impl Fingerprinter {
    pub fn new(domain: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(domain.len() as u64).to_le_bytes());
        hasher.update(domain.as_bytes());
        Self { hasher }
    }

    pub fn part(&mut self, name: &str, bytes: &[u8]) -> &mut Self {
        self.hasher.update(&(name.len() as u64).to_le_bytes());
        self.hasher.update(name.as_bytes());
        self.hasher.update(&(bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
        self
    }

    pub fn finish(&self) -> String {
        self.hasher.finalize().to_hex().to_string()
    }
}

/// Fingerprint a set of upstream outputs by name and content digest.
///
/// Order-independent: outputs are sorted by name first.
pub fn fingerprint_outputs(domain: &str, outputs: &[OutputRef]) -> String {
    let mut sorted: Vec<&OutputRef> = outputs.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    let mut fp = Fingerprinter::new(domain);
    for out in sorted {
        fp.part(&out.name, out.digest.as_bytes());
    }
    fp.finish()
}

/// BLAKE3 hex digest of a byte slice.
pub fn digest_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// BLAKE3 hex digest of a file's content.
pub async fn digest_file(path: &Path) -> std::io::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(digest_bytes(&bytes))
}

/// Build an [`OutputRef`] for a file that was just written.
pub fn output_ref(name: impl Into<String>, path: &Path, bytes: &[u8]) -> OutputRef {
    OutputRef {
        name: name.into(),
        path: path.to_path_buf(),
        digest: digest_bytes(bytes),
    }
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write `bytes` to `path` atomically: temp file in the same directory, then
/// rename. Readers never observe a partially written file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    let io_err = |source: std::io::Error| PipelineError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent).await.map_err(io_err)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    let tmp_path = parent.join(format!(
        ".{}.{}.{}.tmp",
        file_name,
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    tokio::fs::write(&tmp_path, bytes).await.map_err(io_err)?;
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(io_err(e));
    }
    Ok(())
}

/// Process-external stage memoization.
pub struct PipelineCache {
    root: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl PipelineCache {
    /// Open a cache rooted at `root`. Directories are created lazily on store.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root
            .join(&key.stage)
            .join(format!("{}.json", key.entry_id()))
    }

    /// Serialize work on one key: hold the guard across lookup → compute →
    /// store so two tasks never race to fill the same entry.
    pub async fn lock(&self, key: &CacheKey) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(key.entry_id())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Return the entry for `key` if it exists and all its outputs are intact.
    pub async fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        let path = self.entry_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("cache miss: {} {}", key.stage, key.code_version);
                return None;
            }
            Err(e) => {
                warn!("cache entry {} unreadable, treating as miss: {}", path.display(), e);
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("cache entry {} corrupt, treating as miss: {}", path.display(), e);
                return None;
            }
        };

        if entry.key != *key {
            warn!("cache entry {} belongs to another key, treating as miss", path.display());
            return None;
        }

        for out in &entry.outputs {
            match digest_file(&out.path).await {
                Ok(digest) if digest == out.digest => {}
                Ok(_) => {
                    warn!(
                        "cached output {} was modified since {}, recomputing",
                        out.path.display(),
                        key.stage
                    );
                    return None;
                }
                Err(e) => {
                    warn!(
                        "cached output {} is missing ({}), recomputing",
                        out.path.display(),
                        e
                    );
                    return None;
                }
            }
        }

        debug!("cache hit: {} {} ({} outputs)", key.stage, key.code_version, entry.outputs.len());
        Some(entry)
    }

    /// Record a successful stage result. Call only after every output file is
    /// fully written.
    pub async fn store(
        &self,
        key: &CacheKey,
        outputs: Vec<OutputRef>,
        counts: BTreeMap<String, usize>,
    ) -> Result<CacheEntry, PipelineError> {
        let entry = CacheEntry {
            key: key.clone(),
            outputs,
            counts,
            created_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&entry)
            .map_err(|e| PipelineError::Internal(format!("cache entry serialisation: {e}")))?;
        write_atomic(&self.entry_path(key), &json).await?;
        Ok(entry)
    }
}
