//! Schema checks on a converted exam.
//!
//! Validation never fails a run. It produces a [`ValidationReport`] that is
//! returned next to the document; `valid` is false only when the document
//! has no questions at all.

use crate::error::ExamError;
use crate::exam::ExamDocument;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Check `exam` against the structural rules.
pub fn validate(exam: &ExamDocument) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if exam.is_empty() {
        errors.push("No questions found".to_string());
    }

    match &exam.answer_key {
        None => warnings.push("Missing answer key".to_string()),
        Some(key) if key.is_empty() => warnings.push("Answer key is empty".to_string()),
        Some(_) => {}
    }

    let sections = [
        ("multiple_choice", exam.multiple_choice.len()),
        ("true_false", exam.true_false.len()),
        ("short_answer", exam.short_answer.len()),
    ];
    for (name, len) in sections {
        if len == 0 {
            warnings.push(format!("Section {} is empty", name));
        }
    }

    for q in &exam.multiple_choice {
        check_content("multiple_choice", q.number, &q.content, &mut warnings);
        if q.options.len() < 2 {
            warnings.push(format!(
                "multiple_choice question {} has {} option(s)",
                q.number,
                q.options.len()
            ));
        }
    }
    for q in &exam.true_false {
        check_content("true_false", q.number, &q.content, &mut warnings);
        if q.statements.is_empty() {
            warnings.push(format!("true_false question {} has no statements", q.number));
        }
    }
    for q in &exam.short_answer {
        check_content("short_answer", q.number, &q.content, &mut warnings);
    }

    check_duplicates("multiple_choice", exam.multiple_choice.iter().map(|q| q.number), &mut warnings);
    check_duplicates("true_false", exam.true_false.iter().map(|q| q.number), &mut warnings);
    check_duplicates("short_answer", exam.short_answer.iter().map(|q| q.number), &mut warnings);

    ValidationReport {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

fn check_content(section: &str, number: u32, content: &str, warnings: &mut Vec<String>) {
    if content.trim().is_empty() {
        warnings.push(format!("{} question {} has empty content", section, number));
    }
}

fn check_duplicates(section: &str, numbers: impl Iterator<Item = u32>, warnings: &mut Vec<String>) {
    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    for n in numbers {
        // 0 means the model gave no number
        if n != 0 && !seen.insert(n) && reported.insert(n) {
            warnings.push(format!("{} question number {} appears more than once", section, n));
        }
    }
}

/// Re-validate a persisted `result.json`.
pub fn validate_file(path: impl AsRef<Path>) -> Result<ValidationReport, ExamError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ExamError::FileNotFound {
            path: path.to_path_buf(),
        },
        std::io::ErrorKind::PermissionDenied => ExamError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => ExamError::io(path, e),
    })?;
    let exam: ExamDocument =
        serde_json::from_str(&text).map_err(|e| ExamError::SchemaMismatch(e.to_string()))?;
    Ok(validate(&exam))
}
