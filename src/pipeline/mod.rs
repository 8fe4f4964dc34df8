//! Pipeline stages for turning a biography book into tables.
//!
//! Each submodule implements exactly one transformation step and is testable
//! without the others; the stage drivers in [`crate::run`] add caching,
//! persistence and progress events on top.
//!
//! ## Data Flow
//!
//! ```text
//! outline ──▶ segment ──▶ text ──▶ structure ──▶ normalize
//! (pdfium)    (split)    (pdfium)  (LLM+repair)   (CSV)
//! ```
//!
//! 1. [`outline`]   - read the bookmark tree into owned entries
//! 2. [`segment`]   - plan one page range per subject and write sub-documents;
//!    runs in `spawn_blocking` because pdfium is not async-safe
//! 3. [`text`]      - per-page text layer into a transcript
//! 4. [`structure`] - completion call with timeout, retry and validation;
//!    the only stage with network I/O
//! 5. [`repair`]    - deterministic fixes for malformed model JSON
//! 6. [`normalize`] - flatten records into six tables

pub mod normalize;
pub mod outline;
pub mod repair;
pub mod segment;
pub mod structure;
pub mod text;
