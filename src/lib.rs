//! # pioneer-tables
//!
//! Turn a bookmarked biography collection (one PDF, one chapter per person)
//! into six relational CSV tables using a language model for extraction.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Segment     bookmark outline → one sub-PDF per subject (pdfium)
//!  ├─ 2. Text        sub-PDF → per-page transcript (pdfium text layer)
//!  ├─ 3. Structure   transcript → validated JSON record (LLM + repair + retry)
//!  └─ 4. Normalize   records → personal / degrees / employment / visits /
//!                    honors / parents CSVs
//! ```
//!
//! Every stage is memoised in a [`PipelineCache`] keyed by the stage name, a
//! manually bumped code version, and a fingerprint of its upstream outputs.
//! Structured extraction is additionally memoised per subject, so editing
//! one transcript costs one completion call, not forty.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pioneer_tables::{run_pipeline, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / ...
//!     let config = PipelineConfig::builder().output_dir("output").build()?;
//!     let report = run_pipeline("women-in-mathematics.pdf", &config).await?;
//!     for stage in &report.stages {
//!         println!("{}", stage.summary());
//!     }
//!     for failure in report.failures() {
//!         eprintln!("{failure}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pioneer` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! pioneer-tables = { version = "0.1", default-features = false }
//! ```
//!
//! ## Forcing a Recompute
//!
//! Outputs are reused whenever a stage's inputs are byte-identical. After
//! changing a prompt or a parsing rule, bump that stage's entry in
//! [`StageVersions`]; downstream stages follow automatically because their
//! fingerprints change with it.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cache;
pub mod completion;
pub mod config;
pub mod error;
pub mod output;
pub mod pdf;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod record;
pub mod run;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cache::{CacheEntry, CacheKey, PipelineCache};
pub use completion::{CompletionBackend, CompletionRequest, LlmBackend, ScriptedBackend};
pub use config::{PipelineConfig, PipelineConfigBuilder, StageVersions};
pub use error::{PipelineError, SubjectError};
pub use output::{OutputRef, PipelineReport, StageName, StageReport};
pub use pipeline::outline::{DocumentOutline, OutlineEntry};
pub use pipeline::segment::{plan_segments, SegmentManifest, SubjectSegment};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use record::BiographyRecord;
pub use run::{
    extract_structure_stage, extract_text_stage, inspect_outline, normalize_stage, run_pipeline,
    segment_stage,
};
