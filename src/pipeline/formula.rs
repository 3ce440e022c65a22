//! Formula deduplication and rasterisation.
//!
//! Exam documents embed every formula as a WMF/EMF picture, and the same
//! formula (`x`, `m`, `\Delta`, a recurring answer choice) is often pasted
//! dozens of times under different media names. Rendering is by far the
//! slowest local step, so conversion is keyed by *content*:
//!
//! ```text
//! names ──dedup──▶ distinct names ──SHA-256──▶ name→hash
//!                                             hash→first name (representative)
//! representatives ──batches of N──▶ Renderer ──▶ representative→png
//! every original name ──name→hash→representative──▶ png
//! ```
//!
//! A batch the renderer rejects is retried member by member so one corrupt
//! picture does not cost the other nineteen. Anything that still fails is
//! left out of the result map; callers treat absence as "no raster".

use crate::config::KILL_GRACE_SECS;
use crate::error::ExamError;
use crate::pipeline::extract::read_media;
use crate::pipeline::process::{self, RunOptions};
use crate::progress::ProgressCallback;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Rasterises vector formula files.
///
/// The contract is deliberately narrow: for each input `dir/x.wmf` a
/// successful call leaves `out_dir/x.png`. The converter checks for those
/// files itself, so an implementation may return `Ok` after a partial run.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, inputs: &[PathBuf], out_dir: &Path) -> Result<(), ExamError>;
}

/// LibreOffice in headless mode: `soffice --headless --convert-to png --outdir DIR files…`.
#[derive(Debug, Clone)]
pub struct SofficeRenderer {
    binary: PathBuf,
    timeout: Duration,
}

impl SofficeRenderer {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Renderer for SofficeRenderer {
    async fn render(&self, inputs: &[PathBuf], out_dir: &Path) -> Result<(), ExamError> {
        // A private profile per output dir: two soffice instances sharing the
        // default profile block each other on its lock file.
        let profile = out_dir.join(".lo-profile");
        let mut cmd = Command::new(&self.binary);
        cmd.arg(format!("-env:UserInstallation=file://{}", profile.display()))
            .arg("--headless")
            .arg("--convert-to")
            .arg("png")
            .arg("--outdir")
            .arg(out_dir)
            .args(inputs);

        let outcome = process::run(
            cmd,
            RunOptions {
                timeout: Some(self.timeout),
                grace: Duration::from_secs(KILL_GRACE_SECS),
                ..Default::default()
            },
        )
        .await?;
        outcome.into_stdout(&self.binary.display().to_string())?;
        Ok(())
    }
}

/// Result of one conversion pass.
#[derive(Debug, Clone, Default)]
pub struct FormulaConversion {
    /// Every requested name that ended with a raster, duplicates included.
    pub converted: HashMap<String, PathBuf>,
    /// Distinct names requested.
    pub distinct: usize,
    /// Distinct contents (representatives) scheduled for rendering.
    pub unique: usize,
    /// Directory holding the rendered PNGs.
    pub png_dir: PathBuf,
}

/// Hex SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// `image3.wmf` → `image3_wmf`; keeps `image3.wmf` and `image3.emf` apart.
fn staging_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

fn source_path(src_dir: &Path, name: &str) -> PathBuf {
    let ext = Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_else(|| "wmf".to_string());
    src_dir.join(format!("{}.{}", staging_stem(name), ext))
}

fn expected_png(png_dir: &Path, name: &str) -> PathBuf {
    png_dir.join(format!("{}.png", staging_stem(name)))
}

/// Convert the named formula assets of `docx`, rendering each distinct content once.
///
/// `work_dir` receives `src/` (staged vector files) and `png/` (renderer output).
pub async fn convert_formulas(
    docx: &Path,
    names: &[String],
    work_dir: &Path,
    renderer: &dyn Renderer,
    batch_size: usize,
    progress: Option<&ProgressCallback>,
) -> Result<FormulaConversion, ExamError> {
    let src_dir = work_dir.join("src");
    let png_dir = work_dir.join("png");
    tokio::fs::create_dir_all(&src_dir)
        .await
        .map_err(|e| ExamError::io(&src_dir, e))?;
    tokio::fs::create_dir_all(&png_dir)
        .await
        .map_err(|e| ExamError::io(&png_dir, e))?;

    // 1. distinct names, first-seen order
    let mut seen = HashSet::new();
    let distinct: Vec<String> = names
        .iter()
        .filter(|n| seen.insert(n.as_str()))
        .cloned()
        .collect();

    // 2. bytes + hash per distinct name
    let docx_owned = docx.to_path_buf();
    let wanted = distinct.clone();
    let media = tokio::task::spawn_blocking(move || read_media(&docx_owned, &wanted))
        .await
        .map_err(|e| ExamError::Internal(format!("Media read task panicked: {}", e)))??;

    // 3. representatives
    let mut name_to_hash: HashMap<&str, String> = HashMap::new();
    let mut hash_to_rep: HashMap<String, &str> = HashMap::new();
    let mut representatives: Vec<&str> = Vec::new();
    for name in &distinct {
        let Some(bytes) = media.get(name) else {
            warn!("Formula asset {} missing from archive", name);
            continue;
        };
        let hash = content_hash(bytes);
        if !hash_to_rep.contains_key(&hash) {
            hash_to_rep.insert(hash.clone(), name.as_str());
            representatives.push(name.as_str());
        }
        name_to_hash.insert(name.as_str(), hash);
    }
    info!(
        "Formulas: {} references, {} distinct names, {} unique contents",
        names.len(),
        distinct.len(),
        representatives.len()
    );

    for rep in &representatives {
        let path = source_path(&src_dir, rep);
        tokio::fs::write(&path, &media[*rep])
            .await
            .map_err(|e| ExamError::io(&path, e))?;
    }

    // 4. batches, with per-member fallback
    let total = representatives.len();
    let mut rendered: HashMap<&str, PathBuf> = HashMap::new();
    let mut done = 0usize;
    for batch in representatives.chunks(batch_size.max(1)) {
        let inputs: Vec<PathBuf> = batch.iter().map(|n| source_path(&src_dir, n)).collect();
        let retry: Vec<&str> = match renderer.render(&inputs, &png_dir).await {
            Ok(()) => batch
                .iter()
                .copied()
                .filter(|n| {
                    let png = expected_png(&png_dir, n);
                    if png.is_file() {
                        rendered.insert(*n, png);
                        false
                    } else {
                        true
                    }
                })
                .collect(),
            Err(e) => {
                warn!("Batch of {} formulas failed ({}); retrying one by one", batch.len(), e);
                batch.to_vec()
            }
        };

        for name in retry {
            let input = source_path(&src_dir, name);
            match renderer.render(std::slice::from_ref(&input), &png_dir).await {
                Ok(()) if expected_png(&png_dir, name).is_file() => {
                    rendered.insert(name, expected_png(&png_dir, name));
                }
                Ok(()) => warn!("Renderer produced no output for {}", name),
                Err(e) => warn!("Formula {} failed to render: {}", name, e),
            }
        }

        done += batch.len();
        debug!("Formula batches: {}/{}", done, total);
        if let Some(cb) = progress {
            cb.on_formula_batch(done, total);
        }
    }

    // 5. fan back out to every requested name
    let converted: HashMap<String, PathBuf> = names
        .iter()
        .filter_map(|name| {
            let hash = name_to_hash.get(name.as_str())?;
            let rep = hash_to_rep.get(hash)?;
            let png = rendered.get(rep)?;
            Some((name.clone(), png.clone()))
        })
        .collect();

    info!(
        "Rendered {}/{} unique formulas; {} references resolved",
        rendered.len(),
        total,
        converted.len()
    );

    Ok(FormulaConversion {
        converted,
        distinct: distinct.len(),
        unique: total,
        png_dir,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Renderer that "rasterises" by copying bytes, recording every call.
    #[derive(Default)]
    pub struct FakeRenderer {
        pub calls: Mutex<Vec<Vec<String>>>,
        /// Any batch containing one of these stems fails as a whole.
        pub poison: Vec<String>,
        /// These stems also fail when rendered alone.
        pub broken: Vec<String>,
    }

    impl FakeRenderer {
        pub fn rendered_files(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().flatten().cloned().collect()
        }
    }

    fn stem(p: &Path) -> String {
        p.file_stem().unwrap().to_string_lossy().into_owned()
    }

    #[async_trait]
    impl Renderer for FakeRenderer {
        async fn render(&self, inputs: &[PathBuf], out_dir: &Path) -> Result<(), ExamError> {
            let stems: Vec<String> = inputs.iter().map(|p| stem(p)).collect();
            self.calls.lock().unwrap().push(stems.clone());

            let poisoned = stems.iter().any(|s| self.poison.contains(s));
            let broken = stems.iter().any(|s| self.broken.contains(s));
            if (inputs.len() > 1 && poisoned) || broken {
                return Err(ExamError::SubprocessFailed {
                    program: "fake".into(),
                    code: 1,
                    stderr: "cannot convert".into(),
                });
            }
            for (input, s) in inputs.iter().zip(&stems) {
                let bytes = std::fs::read(input).unwrap();
                std::fs::write(out_dir.join(format!("{s}.png")), bytes).unwrap();
            }
            Ok(())
        }
    }
}
