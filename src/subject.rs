//! Subject detection from the file name and the exam header.
//!
//! Vietnamese exam files are usually named after the subject (`De thi Toan
//! 12.docx`, `ĐỀ KIỂM TRA HÓA HỌC.docx`) and the first lines of the body
//! repeat it (`Môn: Vật lý`). Matching is done on whole words after case
//! folding, against both the accented and the unaccented spelling, so
//! `hoàn toàn` never reads as mathematics.

use serde::{Deserialize, Serialize};
use std::fmt;
use unicode_normalization::UnicodeNormalization;

/// Body text beyond this many characters is not searched.
const HEADER_CHARS: usize = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
    Math,
    Physics,
    Chemistry,
    Biology,
    English,
    Literature,
    History,
    Geography,
    Informatics,
    Civics,
    Unknown,
}

const KEYWORDS: &[(Subject, &[&str])] = &[
    (Subject::Math, &["toán", "toan", "toán học", "math", "mathematics"]),
    (Subject::Physics, &["vật lý", "vật lí", "vat ly", "vat li", "physics"]),
    (Subject::Chemistry, &["hóa học", "hoá học", "hoa hoc", "chemistry"]),
    (Subject::Biology, &["sinh học", "sinh hoc", "biology"]),
    (Subject::English, &["tiếng anh", "tieng anh", "english"]),
    (Subject::Literature, &["ngữ văn", "ngu van", "văn học", "literature"]),
    (Subject::History, &["lịch sử", "lich su", "history"]),
    (Subject::Geography, &["địa lý", "địa lí", "dia ly", "dia li", "geography"]),
    (Subject::Informatics, &["tin học", "tin hoc", "informatics"]),
    (
        Subject::Civics,
        &["giáo dục công dân", "giao duc cong dan", "gdcd", "kinh tế và pháp luật", "ktpl"],
    ),
];

impl Subject {
    /// Vietnamese display name.
    pub fn display_name(&self) -> &'static str {
        match self {
            Subject::Math => "Toán",
            Subject::Physics => "Vật lý",
            Subject::Chemistry => "Hóa học",
            Subject::Biology => "Sinh học",
            Subject::English => "Tiếng Anh",
            Subject::Literature => "Ngữ văn",
            Subject::History => "Lịch sử",
            Subject::Geography => "Địa lý",
            Subject::Informatics => "Tin học",
            Subject::Civics => "Giáo dục công dân",
            Subject::Unknown => "Không xác định",
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Compose to NFC, lowercase, and join words with single spaces, padded so
/// `" word "` searches match whole words only.
///
/// Decomposed input keeps its accents: `toa\u{300}n` folds to `toàn`, not
/// `toan`. Marks with no precomposed form are dropped.
fn fold(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push(' ');
    let mut gap = false;
    for c in text.nfc().flat_map(char::to_lowercase) {
        if ('\u{0300}'..='\u{036f}').contains(&c) {
            continue;
        }
        if c.is_alphanumeric() {
            if gap {
                out.push(' ');
                gap = false;
            }
            out.push(if c == 'đ' { 'd' } else { c });
        } else {
            gap = true;
        }
    }
    out.push(' ');
    out
}

/// Subject whose keyword occurs earliest in `text`, if any.
fn earliest_match(text: &str) -> Option<Subject> {
    let folded = fold(text);
    KEYWORDS
        .iter()
        .filter_map(|(subject, words)| {
            words
                .iter()
                .filter_map(|w| folded.find(&fold(w)))
                .min()
                .map(|pos| (pos, *subject))
        })
        .min_by_key(|(pos, _)| *pos)
        .map(|(_, s)| s)
}

/// Detect the subject, preferring the file name over the body header.
pub fn detect_subject(filename: &str, text: &str) -> Subject {
    let stem = filename.rsplit_once('.').map(|(s, _)| s).unwrap_or(filename);
    if let Some(subject) = earliest_match(stem) {
        return subject;
    }
    let header: String = text.chars().take(HEADER_CHARS).collect();
    earliest_match(&header).unwrap_or(Subject::Unknown)
}
