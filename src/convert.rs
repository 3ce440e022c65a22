//! Conversion entry points.
//!
//! [`convert`] runs every stage in order for one document and returns the
//! stamped exam with its validation report. Stages run strictly one after
//! another; the only waits are the external programs, each bounded by its
//! own timeout. Any stage error aborts the run before anything is written
//! to the output directory.

use crate::config::{ConversionConfig, PIPELINE_VERSION};
use crate::error::ExamError;
use crate::exam::{ExamDocument, ExamMetadata};
use crate::output::{ConversionOutput, FormulaStats, Stage, StageTimings};
use crate::pipeline::formula::{self, Renderer, SofficeRenderer};
use crate::pipeline::ocr::{OcrBridge, OcrEntry};
use crate::pipeline::{extract, input, model::ModelClient, repair};
use crate::progress::ProgressCallback;
use crate::prompts::{build_prompt, DEFAULT_SYSTEM_PROMPT};
use crate::subject::detect_subject;
use crate::validate::validate;
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// File name of the persisted result inside the run directory.
pub const RESULT_FILE: &str = "result.json";

/// Convert a DOCX exam to the exam JSON schema.
///
/// # Errors
/// Returns `Err(ExamError)` for any fatal stage failure:
/// - file not found / not a DOCX / missing `word/document.xml`
/// - AI CLI failure, timeout or kill
/// - a response that cannot be repaired into exam JSON
/// - the result cannot be written
///
/// Formula rendering and recognition failures are not fatal; they degrade
/// to `[FORMULA_<id>]` markers. Validation findings are reported, not raised.
pub async fn convert(
    input_path: impl AsRef<Path>,
    config: &ConversionConfig,
) -> Result<ConversionOutput, ExamError> {
    let path = input::resolve_input(input_path)?;
    let filename = input::display_name(&path);
    run(&path, &filename, config).await
}

/// Synchronous wrapper around [`convert`].
///
/// Creates a temporary tokio runtime internally.
pub fn convert_sync(
    input_path: impl AsRef<Path>,
    config: &ConversionConfig,
) -> Result<ConversionOutput, ExamError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| ExamError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(convert(input_path, config))
}

/// Convert DOCX bytes held in memory, e.g. an upload.
///
/// The bytes are staged as a temp file under `config.upload_dir`, removed on
/// return. `original_filename` is what ends up in the metadata and drives
/// subject detection.
pub async fn convert_from_bytes(
    bytes: &[u8],
    original_filename: &str,
    config: &ConversionConfig,
) -> Result<ConversionOutput, ExamError> {
    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .map_err(|e| ExamError::io(&config.upload_dir, e))?;
    let mut tmp = tempfile::Builder::new()
        .prefix("upload-")
        .suffix(".docx")
        .tempfile_in(&config.upload_dir)
        .map_err(|e| ExamError::io(&config.upload_dir, e))?;
    tmp.write_all(bytes)
        .map_err(|e| ExamError::io(tmp.path(), e))?;

    let path = input::resolve_input(tmp.path())?;
    // `tmp` is dropped (and the file deleted) when `run` returns
    run(&path, original_filename, config).await
}

/// `exam_<UTC yyyymmddHHMMSS>_<8 alphanumerics>`.
pub fn generate_run_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("exam_{}_{}", Utc::now().format("%Y%m%d%H%M%S"), suffix)
}

// ── Internal helpers ─────────────────────────────────────────────────────

/// Stage timer that also fires the progress callbacks.
struct StageClock<'a> {
    progress: Option<&'a ProgressCallback>,
    timings: StageTimings,
}

impl<'a> StageClock<'a> {
    fn start(&self, stage: Stage) -> Instant {
        debug!("Stage {} started", stage);
        if let Some(cb) = self.progress {
            cb.on_stage_start(stage);
        }
        Instant::now()
    }

    fn finish(&mut self, stage: Stage, started: Instant) {
        let ms = started.elapsed().as_millis() as u64;
        self.timings.record(stage, ms);
        debug!("Stage {} finished in {}ms", stage, ms);
        if let Some(cb) = self.progress {
            cb.on_stage_complete(stage, ms);
        }
    }
}

async fn run(path: &Path, filename: &str, config: &ConversionConfig) -> Result<ConversionOutput, ExamError> {
    let total_start = Instant::now();
    let run_id = generate_run_id();
    let run_dir = config.output_dir.join(&run_id);
    let progress = config.progress_callback.as_ref();
    info!("Starting conversion {}: {}", run_id, filename);

    if let Some(cb) = progress {
        cb.on_conversion_start(&run_id, filename);
    }
    let mut clock = StageClock {
        progress,
        timings: StageTimings::default(),
    };

    // ── Step 1: Parse ────────────────────────────────────────────────────
    let t = clock.start(Stage::Parse);
    let content = extract::extract_content(path).await?;
    let subject = detect_subject(filename, &content.full_text);
    info!(
        "{} paragraphs, {} images ({} formulas), subject: {}",
        content.paragraphs.len(),
        content.images.len(),
        content.formula_images().count(),
        subject
    );
    clock.finish(Stage::Parse, t);

    // ── Step 2: Extract images ───────────────────────────────────────────
    let image_paths = if config.extract_images {
        let t = clock.start(Stage::ExtractImages);
        let written = extract::extract_images(path, &run_dir.join("images")).await?;
        clock.finish(Stage::ExtractImages, t);
        written
    } else {
        Vec::new()
    };

    // ── Step 3–4: Formulas and recognition ───────────────────────────────
    let requests: Vec<(u32, String)> = content
        .formula_images()
        .map(|img| ((img.position + 1) as u32, img.filename.clone()))
        .collect();
    let mut formula_stats = FormulaStats {
        referenced: requests.len(),
        ..Default::default()
    };

    let ocr: Vec<OcrEntry> = if config.enable_ocr && !requests.is_empty() {
        tokio::fs::create_dir_all(&config.upload_dir)
            .await
            .map_err(|e| ExamError::io(&config.upload_dir, e))?;
        let scratch = tempfile::Builder::new()
            .prefix("exam2json-")
            .tempdir_in(&config.upload_dir)
            .map_err(|e| ExamError::io(&config.upload_dir, e))?;

        let t = clock.start(Stage::Formulas);
        let renderer: Arc<dyn Renderer> = match &config.renderer {
            Some(r) => Arc::clone(r),
            None => Arc::new(SofficeRenderer::new(&config.tools.renderer)),
        };
        let names: Vec<String> = requests.iter().map(|(_, name)| name.clone()).collect();
        let conversion = formula::convert_formulas(
            path,
            &names,
            scratch.path(),
            renderer.as_ref(),
            config.formula_batch_size,
            progress,
        )
        .await?;
        formula_stats.unique = conversion.unique;
        formula_stats.converted = names
            .iter()
            .filter(|n| conversion.converted.contains_key(*n))
            .count();
        clock.finish(Stage::Formulas, t);

        let t = clock.start(Stage::Recognition);
        let entries = OcrBridge::from_config(config)
            .recognise(&requests, &conversion.converted, &conversion.png_dir, progress)
            .await;
        formula_stats.recognised = entries.iter().filter(|e| !e.is_fallback()).count();
        clock.finish(Stage::Recognition, t);

        if formula_stats.recognised < formula_stats.referenced {
            warn!(
                "{} of {} formulas left as [FORMULA_n] markers",
                formula_stats.referenced - formula_stats.recognised,
                formula_stats.referenced
            );
        }
        entries
    } else {
        Vec::new()
    };

    // ── Step 5: Model call ───────────────────────────────────────────────
    let t = clock.start(Stage::Model);
    let prompt = build_prompt(filename, subject, &content.paragraphs, &ocr, &content.images);
    let system = config.system_prompt.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT);
    let client = ModelClient::from_config(config);
    let raw = client.complete(&prompt, Some(system)).await?;
    let value = repair::parse_model_json(&raw)?;
    let mut exam = ExamDocument::from_value(value)?;
    clock.finish(Stage::Model, t);

    // ── Step 6: Stamp and validate ───────────────────────────────────────
    let mut stamped_timings = clock.timings.clone();
    stamped_timings.total_ms = total_start.elapsed().as_millis() as u64;
    exam.stamp(ExamMetadata {
        id: run_id.clone(),
        original_filename: filename.to_string(),
        subject,
        pipeline_version: PIPELINE_VERSION.to_string(),
        created_at: Utc::now(),
        model: client.model().to_string(),
        timings: stamped_timings,
    });

    let t = clock.start(Stage::Validate);
    let report = validate(&exam);
    if !report.valid {
        warn!("Validation errors: {}", report.errors.join("; "));
    }
    for w in &report.warnings {
        debug!("Validation warning: {}", w);
    }
    clock.finish(Stage::Validate, t);

    // ── Step 7: Persist ──────────────────────────────────────────────────
    let output_path = if config.save_output {
        let t = clock.start(Stage::Persist);
        let written = persist(&exam, &run_dir).await?;
        clock.finish(Stage::Persist, t);
        Some(written)
    } else {
        None
    };

    let mut timings = clock.timings;
    timings.total_ms = total_start.elapsed().as_millis() as u64;
    info!(
        "Conversion {} complete: {} questions, valid={}, {}ms",
        run_id,
        exam.question_count(),
        report.valid,
        timings.total_ms
    );
    if let Some(cb) = progress {
        cb.on_conversion_complete(&run_id, report.valid);
    }

    Ok(ConversionOutput {
        run_id,
        exam,
        report,
        output_path,
        image_paths,
        ocr,
        formula_stats,
        timings,
    })
}

/// Write `result.json` (pretty) into `run_dir`.
///
/// Uses atomic write (temp file + rename) to prevent partial files.
async fn persist(exam: &ExamDocument, run_dir: &Path) -> Result<PathBuf, ExamError> {
    let path = run_dir.join(RESULT_FILE);
    let write_failed = |e: std::io::Error| ExamError::OutputWriteFailed {
        path: path.clone(),
        source: e,
    };

    let json = serde_json::to_string_pretty(exam)
        .map_err(|e| ExamError::Internal(format!("Failed to serialise result: {}", e)))?;

    tokio::fs::create_dir_all(run_dir).await.map_err(write_failed)?;
    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, json).await.map_err(write_failed)?;
    tokio::fs::rename(&tmp_path, &path).await.map_err(write_failed)?;

    info!("Wrote {}", path.display());
    Ok(path)
}
