//! Input resolution: validate a user-supplied path as a DOCX container.
//!
//! We check the ZIP local-file magic (`PK\x03\x04`) before anything else so a
//! renamed `.doc` or a PDF fails with [`ExamError::NotADocx`] instead of an
//! opaque archive error deep inside the extractor.

use crate::error::ExamError;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";

/// Resolve the input string to a readable DOCX path.
pub fn resolve_input(path_str: impl AsRef<Path>) -> Result<PathBuf, ExamError> {
    let path = path_str.as_ref().to_path_buf();

    if !path.exists() {
        return Err(ExamError::FileNotFound { path });
    }

    match std::fs::File::open(&path) {
        Ok(mut f) => {
            let mut magic = [0u8; 4];
            match f.read_exact(&mut magic) {
                Ok(()) if magic == ZIP_MAGIC => {}
                Ok(()) => return Err(ExamError::NotADocx { path, magic }),
                // Shorter than four bytes: cannot be an archive.
                Err(_) => return Err(ExamError::NotADocx { path, magic }),
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(ExamError::PermissionDenied { path });
        }
        Err(_) => {
            return Err(ExamError::FileNotFound { path });
        }
    }

    debug!("Resolved local DOCX: {}", path.display());
    Ok(path)
}

/// The file name part of the input, used as `original_filename` in metadata.
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_is_not_found() {
        let err = resolve_input("/definitely/not/here.docx").unwrap_err();
        assert!(matches!(err, ExamError::FileNotFound { .. }));
    }

    #[test]
    fn pdf_is_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"%PDF-1.7 rest").unwrap();
        let err = resolve_input(f.path()).unwrap_err();
        match err {
            ExamError::NotADocx { magic, .. } => assert_eq!(&magic, b"%PDF"),
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn tiny_file_is_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"PK").unwrap();
        assert!(matches!(
            resolve_input(f.path()),
            Err(ExamError::NotADocx { .. })
        ));
    }

    #[test]
    fn zip_magic_is_accepted() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"PK\x03\x04whatever").unwrap();
        assert_eq!(resolve_input(f.path()).unwrap(), f.path());
    }

    #[test]
    fn display_name_uses_file_name() {
        assert_eq!(
            display_name(Path::new("/uploads/De thi Toan 12.docx")),
            "De thi Toan 12.docx"
        );
    }
}
