//! Formula recognition bridge.
//!
//! Two recognisers can turn the rendered formula PNGs into LaTeX:
//!
//! * the **recognition service** (primary): a long-running HTTP process with
//!   the models already in memory, probed with `GET /health` and driven with
//!   one `POST /ocr/batch` per run;
//! * the **batch script** (secondary): the same recogniser started cold as a
//!   subprocess, `python math-ocr-v2.py --batch-dir DIR`, which prints one
//!   JSON document on stdout and `Processing i/n: name` lines on stderr.
//!
//! The transport is chosen per call. A service that answers the probe but
//! fails the batch degrades to the script once; a script failure degrades to
//! an empty result set. Either way every requested formula id ends up with
//! an [`OcrEntry`]: unresolved ones carry the `[FORMULA_<id>]` marker.

use crate::config::{ConversionConfig, KILL_GRACE_SECS};
use crate::error::ExamError;
use crate::pipeline::process::{self, truncate, RunOptions};
use crate::progress::ProgressCallback;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Where a formula's text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Recognition service.
    Primary,
    /// Batch script.
    Secondary,
    /// Neither produced usable text; the entry holds a marker.
    Fallback,
}

/// Recognised text for one formula reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrEntry {
    pub id: u32,
    /// Media file name inside the document, e.g. `image12.wmf`.
    pub asset: String,
    pub text: String,
    pub provenance: Provenance,
}

impl OcrEntry {
    pub fn is_fallback(&self) -> bool {
        self.provenance == Provenance::Fallback
    }
}

/// Placeholder for a formula that could not be recognised.
pub fn fallback_marker(id: u32) -> String {
    format!("[FORMULA_{}]", id)
}

/// Payload shared by the service's `/ocr/batch` and the script's stdout.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchResponse {
    /// PNG file name → LaTeX, or `[ERROR: …]` for files that failed.
    #[serde(default)]
    pub results: HashMap<String, String>,
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub success_count: usize,
    #[serde(default)]
    pub simple_count: usize,
    #[serde(default)]
    pub complex_count: usize,
    #[serde(default)]
    pub errors: Vec<BatchFileError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchFileError {
    pub file: String,
    pub error: String,
}

/// Texts from whichever recogniser ran, tagged with its provenance.
#[derive(Debug, Clone)]
pub struct Recognition {
    pub texts: HashMap<String, String>,
    pub provenance: Provenance,
}

impl Recognition {
    fn nothing() -> Self {
        Self {
            texts: HashMap::new(),
            provenance: Provenance::Fallback,
        }
    }

    /// Usable text for a PNG file name; error markers count as empty.
    fn text_for(&self, file_name: &str) -> Option<&str> {
        let text = self.texts.get(file_name)?.trim();
        if text.is_empty() || text.starts_with("[ERROR") {
            None
        } else {
            Some(text)
        }
    }
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    #[serde(default)]
    models_loaded: ModelsLoaded,
}

#[derive(Debug, Default, Deserialize)]
struct ModelsLoaded {
    #[serde(default)]
    pix2tex: bool,
    #[serde(default)]
    easyocr: bool,
}

static RE_PROGRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*Processing (\d+)/(\d+): (.+?)\s*$").unwrap());

/// `Processing 3/17: image5_wmf.png` → `(3, 17, "image5_wmf.png")`.
pub fn parse_progress_line(line: &str) -> Option<(usize, usize, String)> {
    let caps = RE_PROGRESS.captures(line)?;
    let current = caps[1].parse().ok()?;
    let total = caps[2].parse().ok()?;
    Some((current, total, caps[3].to_string()))
}

/// Client for both recognisers.
#[derive(Debug, Clone)]
pub struct OcrBridge {
    base_url: String,
    probe_timeout: Duration,
    request_timeout: Duration,
    python: PathBuf,
    script: PathBuf,
}

impl OcrBridge {
    pub fn new(base_url: impl Into<String>, python: impl Into<PathBuf>, script: impl Into<PathBuf>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            probe_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(600),
            python: python.into(),
            script: script.into(),
        }
    }

    pub fn from_config(config: &ConversionConfig) -> Self {
        Self::new(
            config.ocr_service_url.clone(),
            config.tools.python.clone(),
            config.tools.ocr_script.clone(),
        )
        .with_probe_timeout(Duration::from_secs(config.ocr_probe_timeout_secs))
        .with_request_timeout(Duration::from_secs(config.ocr_request_timeout_secs))
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// True when `/health` answers in time with both models loaded.
    pub async fn is_service_available(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        let client = match reqwest::Client::builder().timeout(self.probe_timeout).build() {
            Ok(c) => c,
            Err(e) => {
                warn!("Cannot build HTTP client: {}", e);
                return false;
            }
        };

        let health: HealthResponse = match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json().await {
                Ok(h) => h,
                Err(e) => {
                    debug!("Unreadable health response from {}: {}", url, e);
                    return false;
                }
            },
            Ok(resp) => {
                debug!("Health probe {} returned {}", url, resp.status());
                return false;
            }
            Err(e) => {
                debug!("Health probe {} failed: {}", url, e);
                return false;
            }
        };

        let ready = health.status == "ok" && health.models_loaded.pix2tex && health.models_loaded.easyocr;
        if !ready {
            debug!(
                "Recognition service not ready: status={} pix2tex={} easyocr={}",
                health.status, health.models_loaded.pix2tex, health.models_loaded.easyocr
            );
        }
        ready
    }

    async fn service_batch(&self, dir: &Path) -> Result<BatchResponse, ExamError> {
        let url = format!("{}/ocr/batch", self.base_url);
        let unavailable = |reason: String| ExamError::ServiceUnavailable {
            url: url.clone(),
            reason,
        };

        let client = reqwest::Client::builder()
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| unavailable(e.to_string()))?;

        let directory = std::path::absolute(dir).unwrap_or_else(|_| dir.to_path_buf());
        let body = serde_json::json!({
            "directory": directory.to_string_lossy(),
            "pattern": "*.png",
        });

        let resp = client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(unavailable(format!("HTTP {}", resp.status())));
        }
        resp.json::<BatchResponse>()
            .await
            .map_err(|e| unavailable(format!("bad batch payload: {}", e)))
    }

    async fn script_batch(
        &self,
        dir: &Path,
        progress: Option<&ProgressCallback>,
    ) -> Result<BatchResponse, ExamError> {
        let forward = |line: &str| {
            if let Some((current, total, file)) = parse_progress_line(line) {
                debug!("OCR script {}/{}: {}", current, total, file);
                if let Some(cb) = progress {
                    cb.on_ocr_progress(current, total, &file);
                }
            }
        };

        let mut cmd = Command::new(&self.python);
        cmd.arg(&self.script).arg("--batch-dir").arg(dir);
        let program = self.script.display().to_string();

        let outcome = process::run(
            cmd,
            RunOptions {
                timeout: Some(self.request_timeout),
                grace: Duration::from_secs(KILL_GRACE_SECS),
                stdin_file: None,
                on_stderr_line: Some(&forward),
            },
        )
        .await?;
        let stdout = outcome.into_stdout(&program)?;
        parse_script_output(&stdout)
    }

    /// Run whichever recogniser is available over every PNG in `dir`.
    ///
    /// Never fails: the worst case is an empty map tagged [`Provenance::Fallback`].
    pub async fn recognise_dir(&self, dir: &Path, progress: Option<&ProgressCallback>) -> Recognition {
        if self.is_service_available().await {
            info!("Recognition service available at {}", self.base_url);
            match self.service_batch(dir).await {
                Ok(batch) => {
                    log_batch("service", &batch);
                    return Recognition {
                        texts: batch.results,
                        provenance: Provenance::Primary,
                    };
                }
                Err(e) => warn!("Recognition service batch failed, using script: {}", e),
            }
        } else {
            info!("Recognition service unavailable; running {}", self.script.display());
        }

        match self.script_batch(dir, progress).await {
            Ok(batch) => {
                log_batch("script", &batch);
                Recognition {
                    texts: batch.results,
                    provenance: Provenance::Secondary,
                }
            }
            Err(e) => {
                warn!("Recognition script failed; all formulas fall back: {}", e);
                Recognition::nothing()
            }
        }
    }

    /// Recognise every `(id, asset)` pair. The result has exactly one entry per id.
    pub async fn recognise(
        &self,
        requests: &[(u32, String)],
        converted: &HashMap<String, PathBuf>,
        png_dir: &Path,
        progress: Option<&ProgressCallback>,
    ) -> Vec<OcrEntry> {
        let recognition = if converted.is_empty() {
            Recognition::nothing()
        } else {
            self.recognise_dir(png_dir, progress).await
        };
        resolve_entries(requests, converted, &recognition)
    }
}

fn log_batch(source: &str, batch: &BatchResponse) {
    info!(
        "OCR {}: {} files, {} ok ({} simple, {} complex), {} errors",
        source,
        batch.count,
        batch.success_count,
        batch.simple_count,
        batch.complex_count,
        batch.errors.len()
    );
    for err in &batch.errors {
        debug!("OCR {} error on {}: {}", source, err.file, err.error);
    }
}

/// The script prints its JSON last; anything before the first `{` is noise.
fn parse_script_output(stdout: &str) -> Result<BatchResponse, ExamError> {
    let trimmed = stdout.trim();
    if let Ok(batch) = serde_json::from_str(trimmed) {
        return Ok(batch);
    }
    let sliced = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => trimmed,
    };
    serde_json::from_str(sliced).map_err(|e| ExamError::MalformedResponse {
        reason: format!("OCR script output: {}", e),
        preview: truncate(trimmed, 200),
    })
}

/// Pair every requested id with recognised text or its fallback marker.
pub fn resolve_entries(
    requests: &[(u32, String)],
    converted: &HashMap<String, PathBuf>,
    recognition: &Recognition,
) -> Vec<OcrEntry> {
    let mut entries: Vec<OcrEntry> = requests
        .iter()
        .map(|(id, asset)| {
            let text = converted
                .get(asset)
                .and_then(|png| png.file_name())
                .and_then(|name| recognition.text_for(&name.to_string_lossy()).map(str::to_string));
            match text {
                Some(text) => OcrEntry {
                    id: *id,
                    asset: asset.clone(),
                    text,
                    provenance: recognition.provenance,
                },
                None => OcrEntry {
                    id: *id,
                    asset: asset.clone(),
                    text: fallback_marker(*id),
                    provenance: Provenance::Fallback,
                },
            }
        })
        .collect();
    entries.sort_by_key(|e| e.id);
    entries.dedup_by_key(|e| e.id);
    entries
}
