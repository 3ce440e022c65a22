//! Prompts for the AI CLI.
//!
//! The system prompt fixes the output schema; the user prompt carries the
//! document text with formula markers already replaced by recognised LaTeX.
//! Callers can override the system prompt via
//! [`crate::config::ConversionConfig::system_prompt`].

use crate::pipeline::extract::ImageReference;
use crate::pipeline::ocr::OcrEntry;
use crate::subject::Subject;
use std::collections::HashMap;
use std::fmt::Write;

/// Default system prompt: role, rules and the exact JSON shape.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"Bạn là chuyên gia số hoá đề thi THPT của Việt Nam. Nhiệm vụ: chuyển nội dung một đề thi thành JSON đúng cấu trúc dưới đây.

QUY TẮC
1. Giữ nguyên văn nội dung câu hỏi, phương án và mệnh đề. Không tóm tắt, không dịch.
2. Công thức viết bằng LaTeX trong cặp $...$. Các đoạn đã có dạng $...$ trong đề giữ nguyên.
3. Ký hiệu [img_N] là hình ảnh. Đặt nhãn "img_N" vào mảng "images" của câu hỏi chứa nó và xoá ký hiệu khỏi nội dung.
4. Ký hiệu [FORMULA_N] là công thức không nhận dạng được. Giữ nguyên ký hiệu đó trong nội dung.
5. Phần I (trắc nghiệm nhiều phương án) → "multiple_choice". Phần II (đúng/sai) → "true_false". Phần III (trả lời ngắn) → "short_answer".
6. Nếu đề có bảng đáp án, điền vào "answer_key"; nếu không, bỏ qua trường này.
7. Chỉ trả về MỘT đối tượng JSON. Không giải thích, không bọc trong ```.

CẤU TRÚC JSON
{
  "multiple_choice": [
    {"number": 1, "content": "...", "options": [{"label": "A", "content": "..."}, {"label": "B", "content": "..."}, {"label": "C", "content": "..."}, {"label": "D", "content": "..."}], "images": [], "answer": "A"}
  ],
  "true_false": [
    {"number": 1, "content": "...", "statements": [{"label": "a", "content": "...", "answer": true}], "images": []}
  ],
  "short_answer": [
    {"number": 1, "content": "...", "images": [], "answer": "..."}
  ],
  "answer_key": {
    "multiple_choice": {"1": "A"},
    "true_false": {"1": "Đ-S-Đ-S"},
    "short_answer": {"1": "0,5"}
  }
}"#;

/// Substitute recognised formulas for their `[img_N]` markers.
///
/// Formula ids are the image label numbers, so `[img_7]` is replaced by the
/// entry with id 7: `$latex$` when recognised, `[FORMULA_7]` otherwise.
/// Markers of ordinary pictures are left for the model to place.
pub fn substitute_formulas(text: &str, entries: &[OcrEntry]) -> String {
    if entries.is_empty() {
        return text.to_string();
    }
    let by_id: HashMap<u32, &OcrEntry> = entries.iter().map(|e| (e.id, e)).collect();

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("[img_") {
        out.push_str(&rest[..start]);
        let after = &rest[start + "[img_".len()..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let closed = digits > 0 && after[digits..].starts_with(']');
        let entry = closed
            .then(|| after[..digits].parse::<u32>().ok())
            .flatten()
            .and_then(|id| by_id.get(&id));

        match entry {
            Some(e) if e.is_fallback() => out.push_str(&e.text),
            Some(e) => {
                let _ = write!(out, "${}$", e.text.trim().trim_matches('$'));
            }
            None => {
                // not a formula marker; copy the opening bracket and move on
                out.push('[');
                rest = &rest[start + 1..];
                continue;
            }
        }
        rest = &after[digits + 1..];
    }
    out.push_str(rest);
    out
}

/// Build the user prompt for one document.
pub fn build_prompt(
    filename: &str,
    subject: Subject,
    paragraphs: &[String],
    entries: &[OcrEntry],
    images: &[ImageReference],
) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "Tệp: {}", filename);
    if subject != Subject::Unknown {
        let _ = writeln!(prompt, "Môn: {}", subject);
    }

    let pictures: Vec<String> = images
        .iter()
        .filter(|img| !img.is_formula() || entries.is_empty())
        .map(ImageReference::label)
        .collect();
    if !pictures.is_empty() {
        let _ = writeln!(prompt, "Hình ảnh trong đề: {}", pictures.join(", "));
    }

    prompt.push_str("\nNỘI DUNG ĐỀ THI:\n");
    for para in paragraphs {
        prompt.push_str(&substitute_formulas(para, entries));
        prompt.push('\n');
    }
    prompt
}
