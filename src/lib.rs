//! # exam2json
//!
//! Convert Vietnamese exam documents (DOCX) into a strict JSON schema, using
//! an external AI command-line client for the semantic extraction step.
//!
//! ## Why this crate?
//!
//! Exam papers are written in Word with MathType: every formula is a WMF/EMF
//! picture, often the same picture pasted dozens of times. Sending the raw
//! text to a model loses every formula. This crate recovers the text and
//! picture positions from the DOCX markup, renders each *distinct* formula
//! once, recognises it as LaTeX, splices the LaTeX back into the text and
//! only then asks the model for JSON, repairing the usual defects of its
//! answer on the way back.
//!
//! ## Pipeline Overview
//!
//! ```text
//! DOCX
//!  │
//!  ├─ 1. Parse      paragraphs, relationships, [img_N] markers (zip + regex)
//!  ├─ 2. Images     optional copy of word/media/* to the run directory
//!  ├─ 3. Formulas   SHA-256 dedup, soffice in batches of 20
//!  ├─ 4. Recognise  OCR service, or the batch script when it is down
//!  ├─ 5. Model      AI CLI on stdin, timeout + SIGTERM/SIGKILL ladder
//!  ├─ 6. Validate   stamped metadata, advisory schema report
//!  └─ 7. Persist    <output_dir>/<run_id>/result.json
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use exam2json::{convert, ConversionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // EXAM2JSON_* variables pick the model, tools and directories
//!     let config = ConversionConfig::from_env()?;
//!     let output = convert("De thi Toan 12.docx", &config).await?;
//!     println!("{} questions, valid={}", output.exam.question_count(), output.report.valid);
//!     for w in &output.report.warnings {
//!         eprintln!("warning: {w}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `exam2json` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! exam2json = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod error;
pub mod exam;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod subject;
pub mod validate;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    ConversionConfig, ConversionConfigBuilder, ToolPaths, FORMULA_BATCH_SIZE, PIPELINE_VERSION,
};
pub use convert::{convert, convert_from_bytes, convert_sync, generate_run_id};
pub use error::ExamError;
pub use exam::{ExamDocument, ExamMetadata};
pub use output::{ConversionOutput, FormulaStats, Stage, StageTimings};
pub use pipeline::formula::{Renderer, SofficeRenderer};
pub use pipeline::ocr::{OcrEntry, Provenance};
pub use progress::{ConversionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use subject::{detect_subject, Subject};
pub use validate::{validate, validate_file, ValidationReport};
