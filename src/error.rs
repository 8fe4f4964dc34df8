//! Error types for the pioneer-tables library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PipelineError`] - **Fatal**: a stage cannot produce any output at all
//!   (unreadable source PDF, malformed outline, provider not configured,
//!   output directory not writable). Returned as `Err(PipelineError)` from the
//!   stage functions in [`crate::run`].
//!
//! * [`SubjectError`] - **Non-fatal**: a single subject failed (model output
//!   never validated, completion kept timing out) but every other subject is
//!   fine. Collected inside [`crate::output::StageReport::failures`] so a bad
//!   transcript never hides the success of the rest of the batch.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the pioneer-tables library.
///
/// Per-subject failures use [`SubjectError`] and are stored in
/// [`crate::output::StageReport`] rather than propagated here.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    // ── Structural errors (segmentation) ──────────────────────────────────
    /// The bookmark outline has no entry that can become a subject.
    #[error("PDF '{path}' has no usable bookmark entries at or after page {start_page}; nothing to split")]
    EmptyOutline { path: PathBuf, start_page: usize },

    /// Two outline entries normalise to the same subject key.
    #[error("Outline entries '{first_title}' and '{second_title}' both normalise to subject key '{key}'")]
    DuplicateSubject {
        key: String,
        first_title: String,
        second_title: String,
    },

    /// Writing a sub-document failed.
    #[error("Failed to write sub-document for '{key}': {detail}")]
    SplitFailed { key: String, detail: String },

    // ── Upstream errors ───────────────────────────────────────────────────
    /// A stage was given an upstream output it cannot read.
    #[error("Upstream output '{path}' is unreadable: {detail}")]
    UpstreamUnreadable { path: PathBuf, detail: String },

    // ── LLM errors ────────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not write a CSV table.
    #[error("Failed to write table '{path}': {source}")]
    TableWriteFailed {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Place libpdfium next to the binary, install it system-wide, or set\n\
PDFIUM_LIB_PATH=/path/to/libpdfium.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single subject.
///
/// The stage continues with every other subject and reports these in
/// aggregate once it completes.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum SubjectError {
    /// The model never produced a record that repaired and validated.
    #[error("{subject}: extraction failed after {attempts} attempts: {detail}")]
    ExtractionFailed {
        subject: String,
        attempts: u32,
        detail: String,
    },

    /// The validated record could not be persisted.
    #[error("{subject}: record could not be written: {detail}")]
    RecordWriteFailed { subject: String, detail: String },
}

impl SubjectError {
    /// Subject key the failure belongs to.
    pub fn subject(&self) -> &str {
        match self {
            SubjectError::ExtractionFailed { subject, .. }
            | SubjectError::RecordWriteFailed { subject, .. } => subject,
        }
    }
}
