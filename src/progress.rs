//! Progress-callback trait for stage and per-subject pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the pipeline runs each stage and each subject.
//!
//! # Example
//!
//! ```rust
//! use pioneer_tables::{PipelineConfig, PipelineProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     done: AtomicUsize,
//! }
//!
//! impl PipelineProgressCallback for CountingCallback {
//!     fn on_subject_complete(&self, subject: &str, cached: bool) {
//!         let n = self.done.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{n}: {subject} (cached: {cached})");
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { done: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::output::StageName;
use std::sync::Arc;

/// Called by the pipeline as it processes each stage and subject.
///
/// Implementations must be `Send + Sync`: subject events fire concurrently
/// from the structured-extraction worker pool. All methods default to no-ops.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called when a stage starts and its work-item count is known.
    fn on_stage_start(&self, stage: StageName, items: usize) {
        let _ = (stage, items);
    }

    /// Called instead of any per-item events when a stage's whole output was
    /// served from the cache.
    fn on_stage_cached(&self, stage: StageName) {
        let _ = stage;
    }

    /// Called just before a subject's completion request is sent.
    fn on_subject_start(&self, subject: &str) {
        let _ = subject;
    }

    /// Called when a subject's record is available.
    ///
    /// `cached` is true when the record came from the cache and no
    /// completion call was made.
    fn on_subject_complete(&self, subject: &str, cached: bool) {
        let _ = (subject, cached);
    }

    /// Called when a subject fails after all attempts are exhausted.
    fn on_subject_error(&self, subject: &str, error: &str) {
        let _ = (subject, error);
    }

    /// Called once a stage has finished.
    fn on_stage_complete(&self, stage: StageName, succeeded: usize, total: usize) {
        let _ = (stage, succeeded, total);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        completes: AtomicUsize,
        cached: AtomicUsize,
        errors: AtomicUsize,
    }

    impl PipelineProgressCallback for TrackingCallback {
        fn on_subject_start(&self, _subject: &str) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_subject_complete(&self, _subject: &str, cached: bool) {
            self.completes.fetch_add(1, Ordering::SeqCst);
            if cached {
                self.cached.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn on_subject_error(&self, _subject: &str, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_stage_start(StageName::ExtractStructure, 3);
        cb.on_subject_start("noether_emmy");
        cb.on_subject_complete("noether_emmy", false);
        cb.on_subject_error("rudin_mary", "timeout");
        cb.on_stage_cached(StageName::Normalize);
        cb.on_stage_complete(StageName::ExtractStructure, 2, 3);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        tracker.on_subject_start("a_b");
        tracker.on_subject_complete("a_b", true);
        tracker.on_subject_start("c_d");
        tracker.on_subject_error("c_d", "missing field `honors`");

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.cached.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_stage_start(StageName::Segment, 1);
    }
}
