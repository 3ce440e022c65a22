//! Configuration types for exam-to-JSON conversion.
//!
//! All conversion behaviour is controlled through [`ConversionConfig`], built
//! via its [`ConversionConfigBuilder`] or read from the environment with
//! [`ConversionConfig::from_env`]. External binaries are located exactly
//! once, when the config is constructed, and stored in [`ToolPaths`]; no
//! pipeline stage searches the file system for programs on its own.

use crate::error::ExamError;
use crate::pipeline::formula::Renderer;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Number of formula files handed to the renderer per invocation.
pub const FORMULA_BATCH_SIZE: usize = 20;

/// Grace window between SIGTERM and SIGKILL for timed-out subprocesses.
pub const KILL_GRACE_SECS: u64 = 5;

/// Version stamped into every result's metadata.
pub const PIPELINE_VERSION: &str = env!("CARGO_PKG_VERSION");

const AI_CLI_CANDIDATES: &[&str] = &[
    "/usr/local/bin/claude",
    "/opt/homebrew/bin/claude",
    "/usr/bin/claude",
];

const RENDERER_CANDIDATES: &[&str] = &[
    "/usr/bin/soffice",
    "/usr/local/bin/soffice",
    "/usr/lib/libreoffice/program/soffice",
    "/Applications/LibreOffice.app/Contents/MacOS/soffice",
];

const PYTHON_CANDIDATES: &[&str] = &["/usr/bin/python3", "/usr/local/bin/python3"];

/// Locations of every external program the pipeline runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPaths {
    /// The AI command-line client (prompt on stdin, JSON text on stdout).
    pub ai_cli: PathBuf,
    /// Headless office suite used to rasterise WMF/EMF formulas.
    pub renderer: PathBuf,
    /// Interpreter for the fallback OCR script.
    pub python: PathBuf,
    /// Batch OCR script run when the recognition service is down.
    pub ocr_script: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            ai_cli: PathBuf::from("claude"),
            renderer: PathBuf::from("soffice"),
            python: PathBuf::from("python3"),
            ocr_script: PathBuf::from("scripts/math-ocr-v2.py"),
        }
    }
}

impl ToolPaths {
    /// Resolve every tool from an explicit override or a fixed candidate list.
    ///
    /// `lookup` returns the override for an environment variable name; it is
    /// a parameter so tests do not have to mutate the process environment.
    pub fn resolve(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            ai_cli: pick_tool(lookup("EXAM2JSON_CLI_PATH"), AI_CLI_CANDIDATES, defaults.ai_cli),
            renderer: pick_tool(
                lookup("EXAM2JSON_RENDERER"),
                RENDERER_CANDIDATES,
                defaults.renderer,
            ),
            python: pick_tool(lookup("EXAM2JSON_PYTHON"), PYTHON_CANDIDATES, defaults.python),
            ocr_script: lookup("EXAM2JSON_OCR_SCRIPT")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.ocr_script),
        }
    }
}

/// Override wins; otherwise the first existing candidate; otherwise the bare
/// program name, left for `PATH` lookup at spawn time.
fn pick_tool(override_path: Option<String>, candidates: &[&str], fallback: PathBuf) -> PathBuf {
    if let Some(p) = override_path.filter(|s| !s.is_empty()) {
        return PathBuf::from(p);
    }
    candidates
        .iter()
        .map(Path::new)
        .find(|p| p.is_file())
        .map(Path::to_path_buf)
        .unwrap_or(fallback)
}

/// Configuration for one or more exam conversions.
///
/// # Example
/// ```rust
/// use exam2json::ConversionConfig;
///
/// let config = ConversionConfig::builder()
///     .model("opus")
///     .model_timeout_secs(300)
///     .enable_ocr(false)
///     .build()
///     .unwrap();
/// assert_eq!(config.model, "opus");
/// ```
#[derive(Clone)]
pub struct ConversionConfig {
    /// Model identifier passed to the AI CLI's `--model` flag. Default: `sonnet`.
    pub model: String,

    /// Hard limit for one AI CLI invocation, in seconds. Default: 600.
    ///
    /// A full exam (40+ questions with formulas) routinely takes several
    /// minutes to transcribe; ten minutes leaves headroom without letting a
    /// wedged process hold the run forever.
    pub model_timeout_secs: u64,

    /// `--max-turns` for the AI CLI. Default: 1.
    pub max_turns: u32,

    /// Custom system instructions. If None, uses the built-in exam prompt.
    pub system_prompt: Option<String>,

    /// External program locations.
    pub tools: ToolPaths,

    /// Base URL of the formula recognition service. Default: `http://127.0.0.1:8766`.
    pub ocr_service_url: String,

    /// Health-probe timeout in seconds. Default: 5.
    pub ocr_probe_timeout_secs: u64,

    /// Timeout for the batch recognition request in seconds. Default: 600.
    pub ocr_request_timeout_secs: u64,

    /// Run the formula render + OCR stage. Default: true.
    pub enable_ocr: bool,

    /// Copy every media entry into `<output_dir>/<run_id>/images`. Default: false.
    pub extract_images: bool,

    /// Write `<output_dir>/<run_id>/result.json`. Default: true.
    pub save_output: bool,

    /// Formula files per renderer call. Default: [`FORMULA_BATCH_SIZE`].
    pub formula_batch_size: usize,

    /// Root for per-run scratch directories. Default: the system temp dir.
    pub upload_dir: PathBuf,

    /// Root for persisted results. Default: `output`.
    pub output_dir: PathBuf,

    /// Port for an HTTP front-end embedding this library. Default: 3000.
    pub listen_port: u16,

    /// Pre-constructed renderer. Takes precedence over `tools.renderer`.
    pub renderer: Option<Arc<dyn Renderer>>,

    /// Stage and batch progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            model: "sonnet".to_string(),
            model_timeout_secs: 600,
            max_turns: 1,
            system_prompt: None,
            tools: ToolPaths::default(),
            ocr_service_url: "http://127.0.0.1:8766".to_string(),
            ocr_probe_timeout_secs: 5,
            ocr_request_timeout_secs: 600,
            enable_ocr: true,
            extract_images: false,
            save_output: true,
            formula_batch_size: FORMULA_BATCH_SIZE,
            upload_dir: std::env::temp_dir(),
            output_dir: PathBuf::from("output"),
            listen_port: 3000,
            renderer: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ConversionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfig")
            .field("model", &self.model)
            .field("model_timeout_secs", &self.model_timeout_secs)
            .field("max_turns", &self.max_turns)
            .field("tools", &self.tools)
            .field("ocr_service_url", &self.ocr_service_url)
            .field("enable_ocr", &self.enable_ocr)
            .field("extract_images", &self.extract_images)
            .field("save_output", &self.save_output)
            .field("formula_batch_size", &self.formula_batch_size)
            .field("upload_dir", &self.upload_dir)
            .field("output_dir", &self.output_dir)
            .field("renderer", &self.renderer.as_ref().map(|_| "<dyn Renderer>"))
            .finish()
    }
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Build a config from `EXAM2JSON_*` environment variables.
    pub fn from_env() -> Result<Self, ExamError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (the environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ExamError> {
        let mut builder = Self::builder().tools(ToolPaths::resolve(&lookup));

        if let Some(model) = lookup("EXAM2JSON_MODEL").filter(|s| !s.is_empty()) {
            builder = builder.model(model);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "EXAM2JSON_TIMEOUT_SECS")? {
            builder = builder.model_timeout_secs(secs);
        }
        if let Some(url) = lookup("EXAM2JSON_OCR_URL").filter(|s| !s.is_empty()) {
            builder = builder.ocr_service_url(url);
        }
        if let Some(dir) = lookup("EXAM2JSON_UPLOAD_DIR").filter(|s| !s.is_empty()) {
            builder = builder.upload_dir(dir);
        }
        if let Some(dir) = lookup("EXAM2JSON_OUTPUT_DIR").filter(|s| !s.is_empty()) {
            builder = builder.output_dir(dir);
        }
        if let Some(port) = parse_var::<u16>(&lookup, "EXAM2JSON_PORT")? {
            builder = builder.listen_port(port);
        }

        builder.build()
    }

    /// The AI CLI timeout as a `Duration`.
    pub fn model_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.model_timeout_secs)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ExamError> {
    match lookup(key).filter(|s| !s.trim().is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ExamError::InvalidConfig(format!("{key}='{raw}' is not a valid value"))),
    }
}

/// Builder for [`ConversionConfig`].
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl fmt::Debug for ConversionConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl ConversionConfigBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn model_timeout_secs(mut self, secs: u64) -> Self {
        self.config.model_timeout_secs = secs;
        self
    }

    pub fn max_turns(mut self, n: u32) -> Self {
        self.config.max_turns = n.max(1);
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn tools(mut self, tools: ToolPaths) -> Self {
        self.config.tools = tools;
        self
    }

    pub fn ai_cli(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.tools.ai_cli = path.into();
        self
    }

    pub fn ocr_service_url(mut self, url: impl Into<String>) -> Self {
        self.config.ocr_service_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn ocr_probe_timeout_secs(mut self, secs: u64) -> Self {
        self.config.ocr_probe_timeout_secs = secs;
        self
    }

    pub fn ocr_request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.ocr_request_timeout_secs = secs;
        self
    }

    pub fn enable_ocr(mut self, v: bool) -> Self {
        self.config.enable_ocr = v;
        self
    }

    pub fn extract_images(mut self, v: bool) -> Self {
        self.config.extract_images = v;
        self
    }

    pub fn save_output(mut self, v: bool) -> Self {
        self.config.save_output = v;
        self
    }

    pub fn formula_batch_size(mut self, n: usize) -> Self {
        self.config.formula_batch_size = n;
        self
    }

    pub fn upload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.upload_dir = dir.into();
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn listen_port(mut self, port: u16) -> Self {
        self.config.listen_port = port;
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.config.renderer = Some(renderer);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, ExamError> {
        let c = &self.config;
        if c.model.trim().is_empty() {
            return Err(ExamError::InvalidConfig("Model must not be empty".into()));
        }
        if c.model_timeout_secs == 0 {
            return Err(ExamError::InvalidConfig(
                "Model timeout must be ≥ 1 second".into(),
            ));
        }
        if c.formula_batch_size == 0 {
            return Err(ExamError::InvalidConfig(
                "Formula batch size must be ≥ 1".into(),
            ));
        }
        if !c.ocr_service_url.starts_with("http://") && !c.ocr_service_url.starts_with("https://")
        {
            return Err(ExamError::InvalidConfig(format!(
                "OCR service URL must be http(s), got '{}'",
                c.ocr_service_url
            )));
        }
        Ok(self.config)
    }
}
