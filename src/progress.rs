//! Progress-callback trait for conversion stage events.
//!
//! Inject an [`Arc<dyn ConversionProgressCallback>`] via
//! [`crate::config::ConversionConfigBuilder::progress_callback`] to receive
//! events as a run moves through its stages, as formula batches finish and
//! as the OCR script reports per-file progress.
//!
//! # Example
//!
//! ```rust
//! use exam2json::{ConversionProgressCallback, ConversionConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct BatchCounter {
//!     converted: Arc<AtomicUsize>,
//! }
//!
//! impl ConversionProgressCallback for BatchCounter {
//!     fn on_formula_batch(&self, converted: usize, total: usize) {
//!         self.converted.store(converted, Ordering::SeqCst);
//!         eprintln!("formulas {converted}/{total}");
//!     }
//! }
//!
//! let counter = Arc::new(BatchCounter {
//!     converted: Arc::new(AtomicUsize::new(0)),
//! });
//!
//! let config = ConversionConfig::builder()
//!     .progress_callback(counter as Arc<dyn ConversionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::output::Stage;
use std::sync::Arc;

/// Called by the conversion pipeline as a run progresses.
///
/// Stages execute sequentially, so calls never overlap within one run. The
/// trait is still `Send + Sync` because a host may share one callback
/// between runs on different tasks. Every method defaults to a no-op.
pub trait ConversionProgressCallback: Send + Sync {
    /// Called once, after the run id is allocated.
    fn on_conversion_start(&self, run_id: &str, input: &str) {
        let _ = (run_id, input);
    }

    /// Called when a stage begins.
    fn on_stage_start(&self, stage: Stage) {
        let _ = stage;
    }

    /// Called when a stage finishes successfully.
    fn on_stage_complete(&self, stage: Stage, duration_ms: u64) {
        let _ = (stage, duration_ms);
    }

    /// Called after each renderer batch.
    ///
    /// # Arguments
    /// * `converted`: unique formulas processed so far (running counter)
    /// * `total`: unique formulas scheduled
    fn on_formula_batch(&self, converted: usize, total: usize) {
        let _ = (converted, total);
    }

    /// Called for every `Processing i/n: name` line of the OCR script.
    fn on_ocr_progress(&self, current: usize, total: usize, file: &str) {
        let _ = (current, total, file);
    }

    /// Called once after the result is stamped and validated.
    fn on_conversion_complete(&self, run_id: &str, valid: bool) {
        let _ = (run_id, valid);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ConversionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ConversionConfig`].
pub type ProgressCallback = Arc<dyn ConversionProgressCallback>;
