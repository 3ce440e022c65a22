//! CLI binary for exam2json.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ConversionConfig` and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use exam2json::{
    convert, validate_file, ConversionConfig, ConversionProgressCallback, ProgressCallback, Stage,
    ToolPaths,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Spinner for stages, switching to a counted bar while formulas render or
/// the recognition script works through its files.
struct CliProgressCallback {
    bar: ProgressBar,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(spinner_style());
        bar.set_prefix("Preparing");
        bar.set_message("Opening document…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }

    fn counted(&self, prefix: &'static str, unit: &str, pos: usize, total: usize) {
        if self.bar.length() != Some(total as u64) {
            let style = ProgressStyle::with_template(&format!(
                "{{spinner:.cyan}} {{prefix:.bold}}  [{{bar:42.green/238}}] {{pos:>3}}/{{len}} {unit}  ⏱ {{elapsed_precise}}"
            ))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS);
            self.bar.set_style(style);
            self.bar.set_length(total as u64);
            self.bar.set_prefix(prefix);
        }
        self.bar.set_position(pos as u64);
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(TICKS)
}

impl ConversionProgressCallback for CliProgressCallback {
    fn on_conversion_start(&self, run_id: &str, input: &str) {
        self.bar
            .println(format!("{} {}  {}", bold("◆"), bold(input), dim(run_id)));
    }

    fn on_stage_start(&self, stage: Stage) {
        self.bar.set_style(spinner_style());
        self.bar.set_length(0);
        self.bar.set_prefix("Running");
        self.bar.set_message(stage.to_string());
    }

    fn on_stage_complete(&self, stage: Stage, duration_ms: u64) {
        self.bar.println(format!(
            "  {} {:<20} {}",
            green("✓"),
            stage.to_string(),
            dim(&format!("{:.1}s", duration_ms as f64 / 1000.0)),
        ));
    }

    fn on_formula_batch(&self, converted: usize, total: usize) {
        self.counted("Rendering", "formulas", converted, total);
    }

    fn on_ocr_progress(&self, current: usize, total: usize, file: &str) {
        self.counted("Recognising", "images", current, total);
        self.bar.set_message(file.to_string());
    }

    fn on_conversion_complete(&self, _run_id: &str, valid: bool) {
        self.bar.finish_and_clear();
        if valid {
            eprintln!("{} conversion complete", green("✔"));
        } else {
            eprintln!("{} conversion complete with validation errors", yellow("⚠"));
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert, writing output/<run_id>/result.json
  exam2json "De thi Toan 12.docx"

  # Print the full result (exam, report, timings) as JSON
  exam2json --json de.docx > result.json

  # Skip formula recognition and use a different model
  exam2json --no-ocr --model opus de.docx

  # Re-validate an existing result
  exam2json --validate-only output/exam_20250101083000_Ab3dE9xZ/result.json

EXTERNAL TOOLS:
  AI CLI       prompt on stdin, JSON on stdout    (EXAM2JSON_CLI_PATH)
  soffice      WMF/EMF → PNG, headless            (EXAM2JSON_RENDERER)
  OCR service  GET /health, POST /ocr/batch       (EXAM2JSON_OCR_URL)
  OCR script   python math-ocr-v2.py --batch-dir  (EXAM2JSON_PYTHON, EXAM2JSON_OCR_SCRIPT)

ENVIRONMENT VARIABLES:
  EXAM2JSON_MODEL         Model name passed to the AI CLI (default: sonnet)
  EXAM2JSON_TIMEOUT_SECS  AI CLI timeout (default: 600)
  EXAM2JSON_UPLOAD_DIR    Scratch root for per-run temp dirs
  EXAM2JSON_OUTPUT_DIR    Result root (default: output)
"#;

/// Convert Vietnamese exam DOCX files to structured JSON.
#[derive(Parser, Debug)]
#[command(
    name = "exam2json",
    version,
    about = "Convert Vietnamese exam DOCX files to structured JSON",
    long_about = "Convert Vietnamese exam documents (DOCX) into a strict JSON schema. Formulas \
embedded as WMF/EMF are rendered, recognised as LaTeX, and passed to an AI CLI together with \
the document text.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// DOCX exam file (or a result.json with --validate-only).
    input: PathBuf,

    /// Root directory for run outputs.
    #[arg(short, long, env = "EXAM2JSON_OUTPUT_DIR", default_value = "output")]
    output_dir: PathBuf,

    /// Model name passed to the AI CLI.
    #[arg(long, env = "EXAM2JSON_MODEL", default_value = "sonnet")]
    model: String,

    /// AI CLI timeout in seconds.
    #[arg(long, env = "EXAM2JSON_TIMEOUT_SECS", default_value_t = 600)]
    timeout: u64,

    /// Agent turns allowed to the AI CLI.
    #[arg(long, default_value_t = 1)]
    max_turns: u32,

    /// Path to the AI CLI binary.
    #[arg(long)]
    cli_path: Option<PathBuf>,

    /// Path to the soffice binary.
    #[arg(long)]
    renderer: Option<PathBuf>,

    /// Recognition service base URL.
    #[arg(long, env = "EXAM2JSON_OCR_URL", default_value = "http://127.0.0.1:8766")]
    ocr_url: String,

    /// Skip formula rendering and recognition.
    #[arg(long)]
    no_ocr: bool,

    /// Formulas per renderer invocation.
    #[arg(long, default_value_t = exam2json::FORMULA_BATCH_SIZE)]
    batch_size: usize,

    /// Copy every media file into <output-dir>/<run_id>/images.
    #[arg(long)]
    extract_images: bool,

    /// Do not write result.json; print the exam to stdout instead.
    #[arg(long)]
    no_save: bool,

    /// Scratch root for per-run temp dirs.
    #[arg(long, env = "EXAM2JSON_UPLOAD_DIR")]
    upload_dir: Option<PathBuf>,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "EXAM2JSON_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Print the full ConversionOutput as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Validate an existing result.json instead of converting.
    #[arg(long)]
    validate_only: bool,

    /// Disable progress bar.
    #[arg(long, env = "EXAM2JSON_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "EXAM2JSON_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "EXAM2JSON_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level logs unless --verbose is given.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.validate_only;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Validate-only mode ───────────────────────────────────────────────
    if cli.validate_only {
        let report = validate_file(&cli.input)
            .with_context(|| format!("Failed to validate {}", cli.input.display()))?;
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("Failed to serialise report")?
            );
        } else {
            print_report(&report.errors, &report.warnings);
            println!("valid: {}", report.valid);
        }
        return Ok(());
    }

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn ConversionProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb).await?;

    // ── Run conversion ───────────────────────────────────────────────────
    let output = convert(&cli.input, &config)
        .await
        .context("Conversion failed")?;

    if cli.json {
        let json = serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
        println!("{json}");
    } else if output.output_path.is_none() {
        let json =
            serde_json::to_string_pretty(&output.exam).context("Failed to serialise exam")?;
        println!("{json}");
    }

    if !cli.quiet && !cli.json {
        print_report(&output.report.errors, &output.report.warnings);
        let stats = &output.formula_stats;
        eprintln!(
            "   {} questions  ·  formulas {}/{} recognised ({} unique)  ·  {}ms",
            output.exam.question_count(),
            stats.recognised,
            stats.referenced,
            stats.unique,
            output.timings.total_ms,
        );
        if let Some(ref path) = output.output_path {
            eprintln!("   →  {}", bold(&path.display().to_string()));
        }
    }

    Ok(())
}

fn print_report(errors: &[String], warnings: &[String]) {
    for e in errors {
        eprintln!("  {} {}", red("✗"), e);
    }
    for w in warnings {
        eprintln!("  {} {}", yellow("!"), dim(w));
    }
}

/// Map CLI args to `ConversionConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ConversionConfig> {
    let system_prompt = if let Some(ref path) = cli.system_prompt {
        Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read system prompt from {:?}", path))?,
        )
    } else {
        None
    };

    let mut tools = ToolPaths::resolve(|key| std::env::var(key).ok());
    if let Some(ref p) = cli.cli_path {
        tools.ai_cli = p.clone();
    }
    if let Some(ref p) = cli.renderer {
        tools.renderer = p.clone();
    }

    let mut builder = ConversionConfig::builder()
        .model(cli.model.clone())
        .model_timeout_secs(cli.timeout)
        .max_turns(cli.max_turns)
        .tools(tools)
        .ocr_service_url(cli.ocr_url.clone())
        .enable_ocr(!cli.no_ocr)
        .formula_batch_size(cli.batch_size)
        .extract_images(cli.extract_images)
        .save_output(!cli.no_save)
        .output_dir(cli.output_dir.clone());

    if let Some(ref dir) = cli.upload_dir {
        builder = builder.upload_dir(dir.clone());
    }
    if let Some(prompt) = system_prompt {
        builder = builder.system_prompt(prompt);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
