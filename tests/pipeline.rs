//! End-to-end tests of the conversion pipeline with stand-in tools.
//!
//! The AI CLI and the OCR script are small shell scripts written into a temp
//! directory; the renderer is an in-process fake that "rasterises" by copying
//! bytes. Nothing here needs soffice, Python or network access.
//!
//! Run with:
//!   cargo test --test pipeline -- --nocapture

#![cfg(unix)]

use async_trait::async_trait;
use exam2json::{
    convert, convert_from_bytes, validate_file, ConversionConfig, ConversionProgressCallback,
    ExamError, Provenance, Renderer, Stage, Subject, ToolPaths,
};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

// ── Test helpers ─────────────────────────────────────────────────────────────

const RELS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
<Relationship Id="rId11" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/image" Target="media/image1.wmf"/>
<Relationship Id="rId12" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/image" Target="media/image2.wmf"/>
<Relationship Id="rId13" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/image" Target="media/image3.wmf"/>
<Relationship Id="rId14" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/image" Target="media/image4.png"/>
</Relationships>"#;

const DOCUMENT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<w:document><w:body>
<w:p><w:r><w:t>ĐỀ KIỂM TRA – Môn: Toán 12</w:t></w:r></w:p>
<w:p><w:r><w:t>Câu 1. Cho</w:t></w:r><w:r><w:object><v:imagedata r:id="rId11"/></w:object></w:r><w:r><w:t>và</w:t></w:r><w:r><w:object><v:imagedata r:id="rId12"/></w:object></w:r></w:p>
<w:p><w:r><w:t>A.</w:t></w:r><w:r><w:object><v:imagedata r:id="rId13"/></w:object></w:r></w:p>
<w:p><w:r><w:drawing><a:blip r:embed="rId14"/></w:drawing></w:r></w:p>
</w:body></w:document>"#;

/// A DOCX whose image1/image2 formulas share bytes.
fn write_docx(path: &Path) {
    let file = std::fs::File::create(path).unwrap();
    let mut zip = ZipWriter::new(file);
    let opts = SimpleFileOptions::default();
    let entries: [(&str, &[u8]); 6] = [
        ("word/document.xml", DOCUMENT.as_bytes()),
        ("word/_rels/document.xml.rels", RELS.as_bytes()),
        ("word/media/image1.wmf", b"WMF-x-squared"),
        ("word/media/image2.wmf", b"WMF-x-squared"),
        ("word/media/image3.wmf", b"WMF-blank"),
        ("word/media/image4.png", b"\x89PNG-figure"),
    ];
    for (name, bytes) in entries {
        zip.start_file(name, opts).unwrap();
        zip.write_all(bytes).unwrap();
    }
    zip.finish().unwrap();
}

fn write_script(path: &Path, body: &str) -> PathBuf {
    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_path_buf()
}

/// Copies each input to `<stem>.png`, counting calls.
#[derive(Default)]
struct CopyRenderer {
    calls: Mutex<Vec<usize>>,
}

#[async_trait]
impl Renderer for CopyRenderer {
    async fn render(&self, inputs: &[PathBuf], out_dir: &Path) -> Result<(), ExamError> {
        self.calls.lock().unwrap().push(inputs.len());
        for input in inputs {
            let stem = input.file_stem().unwrap().to_string_lossy().into_owned();
            std::fs::copy(input, out_dir.join(format!("{stem}.png"))).unwrap();
        }
        Ok(())
    }
}

const MODEL_REPLY: &str = r#"```json
{
  "multiple_choice": [
    {"number": "1", "content": "Cho $x^2$ và $x^2$. Tính $\frac{1}{2}$", "options": [{"label": "A", "content": "[FORMULA_3]"}, {"label": "B", "content": "2"},], "answer": "A"},
  ],
  "true_false": [],
  "short_answer": [],
  "answer_key": {"multiple_choice": {"1": "A"}},
  "metadata": {"subject": "invented by the model"}
}
```"#;

const OCR_SCRIPT: &str = r#"
echo "Processing 1/2: image1_wmf.png" >&2
echo "Processing 2/2: image3_wmf.png" >&2
cat <<'EOF'
{"results": {"image1_wmf.png": "x^2", "image3_wmf.png": "[ERROR: blank image]"}, "count": 2, "success_count": 1, "simple_count": 1, "complex_count": 0, "errors": [{"file": "image3_wmf.png", "error": "blank image"}]}
EOF
"#;

struct Fixture {
    _tmp: tempfile::TempDir,
    root: PathBuf,
    docx: PathBuf,
    renderer: Arc<CopyRenderer>,
}

impl Fixture {
    fn new(model_reply: &str) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("exam2json=debug")
            .with_test_writer()
            .try_init();
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let docx = root.join("De thi Toan 12.docx");
        write_docx(&docx);

        let reply = root.join("reply.txt");
        std::fs::write(&reply, model_reply).unwrap();
        write_script(
            &root.join("fake-ai"),
            &format!(
                "echo \"$@\" > '{args}'\ncat > '{prompt}'\ncat '{reply}'",
                args = root.join("args.log").display(),
                prompt = root.join("prompt.log").display(),
                reply = reply.display(),
            ),
        );
        std::fs::write(root.join("ocr.sh"), OCR_SCRIPT).unwrap();

        Self {
            _tmp: tmp,
            root,
            docx,
            renderer: Arc::new(CopyRenderer::default()),
        }
    }

    fn config(&self) -> exam2json::ConversionConfigBuilder {
        ConversionConfig::builder()
            .tools(ToolPaths {
                ai_cli: self.root.join("fake-ai"),
                renderer: PathBuf::from("/nonexistent/soffice"),
                python: PathBuf::from("sh"),
                ocr_script: self.root.join("ocr.sh"),
            })
            // nothing listens here: recognition falls through to the script
            .ocr_service_url("http://127.0.0.1:9")
            .ocr_probe_timeout_secs(1)
            .model_timeout_secs(30)
            .renderer(self.renderer.clone())
            .upload_dir(self.root.join("upload"))
            .output_dir(self.root.join("output"))
    }

    fn prompt(&self) -> String {
        std::fs::read_to_string(self.root.join("prompt.log")).unwrap()
    }

    fn output_entries(&self) -> usize {
        std::fs::read_dir(self.root.join("output"))
            .map(|d| d.count())
            .unwrap_or(0)
    }
}

// ── Full pipeline ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_full_conversion() {
    let fx = Fixture::new(MODEL_REPLY);
    let config = fx.config().build().unwrap();

    let output = convert(&fx.docx, &config).await.unwrap();

    // renderer ran once, on the two distinct contents
    assert_eq!(*fx.renderer.calls.lock().unwrap(), vec![2]);
    assert_eq!(output.formula_stats.referenced, 3);
    assert_eq!(output.formula_stats.unique, 2);
    assert_eq!(output.formula_stats.converted, 3);
    assert_eq!(output.formula_stats.recognised, 2);

    // every formula id has an entry
    let ids: Vec<u32> = output.ocr.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(output.ocr[0].provenance, Provenance::Secondary);
    assert_eq!(output.ocr[1].text, "x^2");
    assert_eq!(output.ocr[2].text, "[FORMULA_3]");
    assert_eq!(output.ocr[2].provenance, Provenance::Fallback);

    // prompt carries recognised LaTeX and the fallback marker
    let prompt = fx.prompt();
    assert!(prompt.contains("Câu 1. Cho $x^2$ và $x^2$"), "{prompt}");
    assert!(prompt.contains("A. [FORMULA_3]"), "{prompt}");
    assert!(prompt.contains("Hình ảnh trong đề: img_4"));
    assert!(prompt.contains("Môn: Toán"));

    let args = std::fs::read_to_string(fx.root.join("args.log")).unwrap();
    assert!(args.starts_with("-p --model sonnet --output-format text --max-turns 1 --system-prompt-file "));

    // repaired and stamped
    let mc = &output.exam.multiple_choice[0];
    assert_eq!(mc.number, 1);
    assert!(mc.content.ends_with(r"Tính $\frac{1}{2}$"));
    let meta = output.exam.metadata.as_ref().unwrap();
    assert_eq!(meta.id, output.run_id);
    assert_eq!(meta.subject, Subject::Math);
    assert_eq!(meta.original_filename, "De thi Toan 12.docx");
    assert_eq!(meta.model, "sonnet");
    assert!(meta.timings.get(Stage::Model).is_some());

    assert!(output.report.valid);
    assert!(output
        .report
        .warnings
        .iter()
        .any(|w| w == "Section true_false is empty"));

    // persisted where expected, and re-validates the same way
    let path = output.output_path.clone().unwrap();
    assert_eq!(path, fx.root.join("output").join(&output.run_id).join("result.json"));
    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(saved["metadata"]["subject"], "math");
    assert_eq!(validate_file(&path).unwrap(), output.report);

    // scratch dirs are gone
    let leftovers = std::fs::read_dir(fx.root.join("upload")).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_empty_exam_is_delivered_but_invalid() {
    let fx = Fixture::new(r#"{"multiple_choice": [], "true_false": [], "short_answer": []}"#);
    let config = fx.config().enable_ocr(false).build().unwrap();

    let output = convert(&fx.docx, &config).await.unwrap();

    assert!(!output.report.valid);
    assert_eq!(output.report.errors, vec!["No questions found"]);
    assert!(output.output_path.unwrap().exists());
}

#[tokio::test]
async fn test_ocr_disabled_skips_formula_stages() {
    let fx = Fixture::new(MODEL_REPLY);
    let config = fx.config().enable_ocr(false).save_output(false).build().unwrap();

    let output = convert(&fx.docx, &config).await.unwrap();

    assert!(fx.renderer.calls.lock().unwrap().is_empty());
    assert!(output.ocr.is_empty());
    assert!(output.output_path.is_none());
    assert_eq!(fx.output_entries(), 0);
    assert!(output.timings.get(Stage::Formulas).is_none());
    // markers stay as image labels
    assert!(fx.prompt().contains("Câu 1. Cho [img_1] và [img_2]"));
}

#[tokio::test]
async fn test_extract_images_into_run_dir() {
    let fx = Fixture::new(MODEL_REPLY);
    let config = fx.config().enable_ocr(false).extract_images(true).build().unwrap();

    let output = convert(&fx.docx, &config).await.unwrap();

    let images_dir = fx.root.join("output").join(&output.run_id).join("images");
    assert_eq!(output.image_paths.len(), 4);
    assert!(images_dir.join("image4.png").exists());
    assert!(output.image_paths.iter().all(|p| p.starts_with(&images_dir)));
}

// ── Failures ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_cli_failure_persists_nothing() {
    let fx = Fixture::new(MODEL_REPLY);
    write_script(&fx.root.join("fake-ai"), "echo 'quota exceeded' >&2\nexit 1");
    let config = fx.config().build().unwrap();

    let err = convert(&fx.docx, &config).await.unwrap_err();

    assert!(matches!(err, ExamError::SubprocessFailed { code: 1, .. }), "{err}");
    assert!(err.is_subprocess());
    assert_eq!(fx.output_entries(), 0);
}

#[tokio::test]
async fn test_unrepairable_reply_is_malformed() {
    let fx = Fixture::new("Xin lỗi, tôi không thể xử lý đề thi này.");
    let config = fx.config().enable_ocr(false).build().unwrap();

    let err = convert(&fx.docx, &config).await.unwrap_err();

    match err {
        ExamError::MalformedResponse { preview, .. } => assert!(preview.starts_with("Xin lỗi")),
        other => panic!("unexpected: {other}"),
    }
    assert_eq!(fx.output_entries(), 0);
}

#[tokio::test]
async fn test_model_timeout() {
    let fx = Fixture::new(MODEL_REPLY);
    write_script(&fx.root.join("fake-ai"), "exec sleep 30");
    let config = fx
        .config()
        .enable_ocr(false)
        .model_timeout_secs(1)
        .build()
        .unwrap();

    let started = std::time::Instant::now();
    let err = convert(&fx.docx, &config).await.unwrap_err();

    assert!(matches!(err, ExamError::SubprocessTimeout { secs: 1, .. }), "{err}");
    // one second of timeout plus at most the kill grace window
    assert!(started.elapsed().as_secs() < 15);
}

#[tokio::test]
async fn test_not_a_docx() {
    let fx = Fixture::new(MODEL_REPLY);
    let pdf = fx.root.join("de.pdf");
    std::fs::write(&pdf, b"%PDF-1.7").unwrap();
    let config = fx.config().build().unwrap();

    assert!(matches!(
        convert(&pdf, &config).await,
        Err(ExamError::NotADocx { .. })
    ));
}

// ── Entry points and callbacks ───────────────────────────────────────────────

#[tokio::test]
async fn test_convert_from_bytes_uses_original_name() {
    let fx = Fixture::new(MODEL_REPLY);
    let bytes = std::fs::read(&fx.docx).unwrap();
    let config = fx.config().enable_ocr(false).build().unwrap();

    let output = convert_from_bytes(&bytes, "Đề thi Vật lý.docx", &config)
        .await
        .unwrap();

    let meta = output.exam.metadata.unwrap();
    assert_eq!(meta.original_filename, "Đề thi Vật lý.docx");
    assert_eq!(meta.subject, Subject::Physics);
    assert_eq!(std::fs::read_dir(fx.root.join("upload")).unwrap().count(), 0);
}

/// Regression: the conversion future and callbacks must work under `tokio::spawn`.
#[tokio::test]
async fn test_callback_send_in_tokio_spawn() {
    #[derive(Default)]
    struct Recorder {
        stages: Mutex<Vec<Stage>>,
        batches: Mutex<Vec<(usize, usize)>>,
        ocr_files: Mutex<Vec<String>>,
        finished: Mutex<Option<bool>>,
    }
    impl ConversionProgressCallback for Recorder {
        fn on_stage_complete(&self, stage: Stage, _duration_ms: u64) {
            self.stages.lock().unwrap().push(stage);
        }
        fn on_formula_batch(&self, converted: usize, total: usize) {
            self.batches.lock().unwrap().push((converted, total));
        }
        fn on_ocr_progress(&self, _current: usize, _total: usize, file: &str) {
            self.ocr_files.lock().unwrap().push(file.to_string());
        }
        fn on_conversion_complete(&self, _run_id: &str, valid: bool) {
            *self.finished.lock().unwrap() = Some(valid);
        }
    }

    let fx = Fixture::new(MODEL_REPLY);
    let recorder = Arc::new(Recorder::default());
    let config = fx
        .config()
        .progress_callback(recorder.clone())
        .build()
        .unwrap();
    let docx = fx.docx.clone();

    let handle = tokio::spawn(async move { convert(&docx, &config).await });
    handle.await.unwrap().unwrap();

    assert_eq!(
        *recorder.stages.lock().unwrap(),
        vec![
            Stage::Parse,
            Stage::Formulas,
            Stage::Recognition,
            Stage::Model,
            Stage::Validate,
            Stage::Persist
        ]
    );
    assert_eq!(*recorder.batches.lock().unwrap(), vec![(2, 2)]);
    assert_eq!(
        *recorder.ocr_files.lock().unwrap(),
        vec!["image1_wmf.png", "image3_wmf.png"]
    );
    assert_eq!(*recorder.finished.lock().unwrap(), Some(true));
}

#[test]
fn test_noop_callback_is_send_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<exam2json::NoopProgressCallback>();
    assert_send_sync::<ConversionConfig>();
}
