//! pdfium binding and source-document validation.
//!
//! Validating the `%PDF` magic bytes before handing a file to pdfium turns
//! "wrong file" mistakes into a clear [`PipelineError::NotAPdf`] instead of an
//! opaque parser error.
//!
//! Binding order for the pdfium shared library:
//! 1. `PDFIUM_LIB_PATH` (a file path or a directory containing the library)
//! 2. the current working directory
//! 3. the system library search path

use crate::error::PipelineError;
use pdfium_render::prelude::*;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Bind to a pdfium library.
///
/// pdfium is not async-safe; call this (and everything using the returned
/// handle) from inside `spawn_blocking`.
pub fn bind_pdfium() -> Result<Pdfium, PipelineError> {
    let bindings = match std::env::var("PDFIUM_LIB_PATH") {
        Ok(p) if !p.is_empty() => {
            let path = PathBuf::from(&p);
            let lib = if path.is_dir() {
                Pdfium::pdfium_platform_library_name_at_path(&path)
            } else {
                path
            };
            debug!("Binding pdfium from PDFIUM_LIB_PATH: {}", lib.display());
            Pdfium::bind_to_library(&lib)
        }
        _ => Pdfium::bind_to_library(&Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library()),
    }
    .map_err(|e| PipelineError::PdfiumBindingFailed(format!("{e:?}")))?;

    Ok(Pdfium::new(bindings))
}

/// Open a document, mapping load failures to [`PipelineError::CorruptPdf`].
pub fn open_document<'a>(pdfium: &'a Pdfium, path: &Path) -> Result<PdfDocument<'a>, PipelineError> {
    pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| PipelineError::CorruptPdf {
            path: path.to_path_buf(),
            detail: format!("{e:?}"),
        })
}

/// Check that `path` exists, is readable, and starts with `%PDF`.
pub fn validate_pdf_path(path: &Path) -> Result<(), PipelineError> {
    let path_buf = path.to_path_buf();
    if !path.exists() {
        return Err(PipelineError::FileNotFound { path: path_buf });
    }

    match std::fs::File::open(path) {
        Ok(mut f) => {
            let mut magic = [0u8; 4];
            if f.read_exact(&mut magic).is_ok() && &magic != b"%PDF" {
                return Err(PipelineError::NotAPdf {
                    path: path_buf,
                    magic,
                });
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(PipelineError::PermissionDenied { path: path_buf });
        }
        Err(_) => {
            return Err(PipelineError::FileNotFound { path: path_buf });
        }
    }

    debug!("Validated PDF: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_not_found() {
        let err = validate_pdf_path(Path::new("/definitely/not/here.pdf")).unwrap_err();
        assert!(matches!(err, PipelineError::FileNotFound { .. }));
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.pdf");
        std::fs::write(&path, b"hello world").unwrap();
        match validate_pdf_path(&path).unwrap_err() {
            PipelineError::NotAPdf { magic, .. } => assert_eq!(&magic, b"hell"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn pdf_magic_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.pdf");
        std::fs::write(&path, b"%PDF-1.7\n").unwrap();
        assert!(validate_pdf_path(&path).is_ok());
    }
}
