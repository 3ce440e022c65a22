//! Pipeline stages for exam-to-JSON conversion.
//!
//! Each submodule implements one step; [`crate::convert`] chains them.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ extract ──▶ formula ──▶ ocr ──▶ model ──▶ repair
//! (path)    (zip/xml)   (soffice)   (LaTeX)  (AI CLI)  (JSON)
//! ```
//!
//! 1. [`input`]: check the path is a readable ZIP container
//! 2. [`extract`]: paragraphs, relationships and image references, by regex
//!    over `word/document.xml`; runs in `spawn_blocking`
//! 3. [`formula`]: hash WMF/EMF assets and rasterise each distinct one once
//! 4. [`ocr`]: recognition service, or the batch script when it is down
//! 5. [`model`]: one AI CLI call with timeout and kill escalation
//! 6. [`repair`]: fences, trailing commas and LaTeX backslashes
//!
//! [`process`] is the shared subprocess runner used by stages 3–5.

pub mod extract;
pub mod formula;
pub mod input;
pub mod model;
pub mod ocr;
pub mod process;
pub mod repair;
