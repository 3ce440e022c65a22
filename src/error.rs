//! Error types for the exam2json library.
//!
//! Only fatal conditions live here. A run either produces a complete
//! [`crate::exam::ExamDocument`] or fails with an [`ExamError`]; nothing
//! partial is persisted.
//!
//! Per-asset problems are deliberately *not* errors:
//!
//! * a formula that cannot be extracted or rendered is simply absent from
//!   the conversion map (see [`crate::pipeline::formula`]);
//! * a formula the recogniser cannot read becomes a fallback entry
//!   (see [`crate::pipeline::ocr`]);
//! * schema problems in the final JSON are advisory and reported through
//!   [`crate::validate::ValidationReport`].
//!
//! The three subprocess failure kinds (`SubprocessTimeout`,
//! `SubprocessKilled`, `SubprocessFailed`) are kept distinct so callers can
//! tell a hung model CLI from a crashed one from one that refused the input.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the exam2json library.
#[derive(Debug, Error)]
pub enum ExamError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file exists and was read, but is not a ZIP-based DOCX container.
    #[error("File is not a DOCX document: '{path}'\nFirst bytes: {magic:?}")]
    NotADocx { path: PathBuf, magic: [u8; 4] },

    // ── Container errors ──────────────────────────────────────────────────
    /// The ZIP directory could not be read.
    #[error("Document '{path}' is not a readable archive: {detail}")]
    InvalidArchive { path: PathBuf, detail: String },

    /// A part every DOCX must carry is absent (e.g. `word/document.xml`).
    #[error("Document '{path}' has no '{entry}' part")]
    MissingDocumentEntry { path: PathBuf, entry: String },

    // ── Subprocess errors ─────────────────────────────────────────────────
    /// The external program could not be started at all.
    #[error("Failed to start '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The external program exceeded its time budget and was terminated.
    #[error("'{program}' timed out after {secs}s and was terminated")]
    SubprocessTimeout { program: String, secs: u64 },

    /// The external program died from a signal it did not receive from us.
    #[error("'{program}' was killed by signal {signal}")]
    SubprocessKilled { program: String, signal: i32 },

    /// The external program exited with a non-zero status.
    #[error("'{program}' exited with code {code}: {stderr}")]
    SubprocessFailed {
        program: String,
        code: i32,
        stderr: String,
    },

    // ── Service errors ────────────────────────────────────────────────────
    /// The OCR recognition service could not be reached or answered badly.
    #[error("Recognition service at '{url}' unavailable: {reason}")]
    ServiceUnavailable { url: String, reason: String },

    // ── Model output errors ───────────────────────────────────────────────
    /// The model output could not be repaired into valid JSON.
    #[error("Model returned malformed JSON: {reason}\nPreview: {preview}")]
    MalformedResponse { reason: String, preview: String },

    /// The model output was JSON but not shaped like an exam document.
    #[error("Model JSON does not match the exam schema: {0}")]
    SchemaMismatch(String),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the result file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Other file-system failure while staging a run.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExamError {
    /// Wrap an `io::Error` with the path it happened on.
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ExamError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for the subprocess failure kinds.
    pub fn is_subprocess(&self) -> bool {
        matches!(
            self,
            ExamError::SubprocessTimeout { .. }
                | ExamError::SubprocessKilled { .. }
                | ExamError::SubprocessFailed { .. }
                | ExamError::SpawnFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_display() {
        let e = ExamError::SubprocessTimeout {
            program: "claude".into(),
            secs: 600,
        };
        let msg = e.to_string();
        assert!(msg.contains("600s"), "got: {msg}");
        assert!(msg.contains("claude"));
    }

    #[test]
    fn missing_entry_display() {
        let e = ExamError::MissingDocumentEntry {
            path: PathBuf::from("de-thi.docx"),
            entry: "word/document.xml".into(),
        };
        assert!(e.to_string().contains("word/document.xml"));
    }

    #[test]
    fn malformed_response_carries_preview() {
        let e = ExamError::MalformedResponse {
            reason: "expected value".into(),
            preview: "not json at all".into(),
        };
        assert!(e.to_string().contains("not json at all"));
    }

    #[test]
    fn subprocess_kinds_are_distinct() {
        let timeout = ExamError::SubprocessTimeout {
            program: "x".into(),
            secs: 1,
        };
        let killed = ExamError::SubprocessKilled {
            program: "x".into(),
            signal: 9,
        };
        let failed = ExamError::SubprocessFailed {
            program: "x".into(),
            code: 2,
            stderr: String::new(),
        };
        assert!(timeout.is_subprocess() && killed.is_subprocess() && failed.is_subprocess());
        assert!(!ExamError::InvalidConfig("x".into()).is_subprocess());
        assert!(matches!(timeout, ExamError::SubprocessTimeout { .. }));
        assert!(!matches!(killed, ExamError::SubprocessTimeout { .. }));
    }
}
