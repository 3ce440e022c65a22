//! External-model client: one AI CLI invocation per call.
//!
//! The prompt is staged into a private temp directory and fed to the child
//! on stdin, never on the command line (exam text easily exceeds `ARG_MAX`
//! and would show up in `ps`). The directory is removed once the child has
//! settled, whatever the outcome.

use crate::config::{ConversionConfig, KILL_GRACE_SECS};
use crate::error::ExamError;
use crate::pipeline::process::{self, RunOptions};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ModelClient {
    cli: PathBuf,
    model: String,
    max_turns: u32,
    timeout: Duration,
    grace: Duration,
    scratch_root: PathBuf,
}

impl ModelClient {
    pub fn new(cli: impl Into<PathBuf>, model: impl Into<String>) -> Self {
        Self {
            cli: cli.into(),
            model: model.into(),
            max_turns: 1,
            timeout: Duration::from_secs(600),
            grace: Duration::from_secs(KILL_GRACE_SECS),
            scratch_root: std::env::temp_dir(),
        }
    }

    pub fn from_config(config: &ConversionConfig) -> Self {
        Self::new(config.tools.ai_cli.clone(), config.model.clone())
            .with_max_turns(config.max_turns)
            .with_timeout(config.model_timeout())
            .with_scratch_root(config.upload_dir.clone())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_max_turns(mut self, turns: u32) -> Self {
        self.max_turns = turns;
        self
    }

    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = root.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// `-p --model M --output-format text --max-turns N [--system-prompt-file F]`
    pub fn args(&self, system_file: Option<&Path>) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-p".into(),
            "--model".into(),
            self.model.clone().into(),
            "--output-format".into(),
            "text".into(),
            "--max-turns".into(),
            self.max_turns.to_string().into(),
        ];
        if let Some(file) = system_file {
            args.push("--system-prompt-file".into());
            args.push(file.as_os_str().to_owned());
        }
        args
    }

    /// Send `prompt` (and optional system instructions) and return the raw stdout.
    pub async fn complete(&self, prompt: &str, system: Option<&str>) -> Result<String, ExamError> {
        tokio::fs::create_dir_all(&self.scratch_root)
            .await
            .map_err(|e| ExamError::io(&self.scratch_root, e))?;
        let scratch = tempfile::Builder::new()
            .prefix("exam2json-model-")
            .tempdir_in(&self.scratch_root)
            .map_err(|e| ExamError::io(&self.scratch_root, e))?;

        let prompt_file = scratch.path().join("prompt.txt");
        tokio::fs::write(&prompt_file, prompt)
            .await
            .map_err(|e| ExamError::io(&prompt_file, e))?;

        let system_file = match system {
            Some(text) => {
                let path = scratch.path().join("system.txt");
                tokio::fs::write(&path, text)
                    .await
                    .map_err(|e| ExamError::io(&path, e))?;
                Some(path)
            }
            None => None,
        };

        let mut cmd = Command::new(&self.cli);
        cmd.args(self.args(system_file.as_deref()));

        info!(
            "Calling {} (model={}, prompt={} chars, timeout={}s)",
            self.cli.display(),
            self.model,
            prompt.chars().count(),
            self.timeout.as_secs()
        );
        let started = Instant::now();
        let result = process::run(
            cmd,
            RunOptions {
                timeout: Some(self.timeout),
                grace: self.grace,
                stdin_file: Some(prompt_file),
                on_stderr_line: None,
            },
        )
        .await;

        let scratch_path = scratch.path().to_path_buf();
        if let Err(e) = scratch.close() {
            warn!("Failed to remove {}: {}", scratch_path.display(), e);
        }

        let stdout = result?.into_stdout(&self.cli.display().to_string())?;
        debug!(
            "Model replied with {} bytes in {} ms",
            stdout.len(),
            started.elapsed().as_millis()
        );

        if stdout.trim().is_empty() {
            return Err(ExamError::MalformedResponse {
                reason: "empty response from AI CLI".to_string(),
                preview: String::new(),
            });
        }
        Ok(stdout)
    }
}
