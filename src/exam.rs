//! The exam JSON schema.
//!
//! This is the external contract: every result file is one [`ExamDocument`].
//! Deserialisation is forgiving about what models actually emit (numbers
//! written as strings, missing sections, extra keys) while serialisation is
//! always the canonical shape.

use crate::error::ExamError;
use crate::output::StageTimings;
use crate::subject::Subject;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A converted exam: three graded sections, the answer key, and run metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExamDocument {
    /// Phần I: four-option multiple choice.
    #[serde(default)]
    pub multiple_choice: Vec<MultipleChoiceQuestion>,
    /// Phần II: true/false with lettered statements.
    #[serde(default)]
    pub true_false: Vec<TrueFalseQuestion>,
    /// Phần III: short numeric or text answer.
    #[serde(default)]
    pub short_answer: Vec<ShortAnswerQuestion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_key: Option<AnswerKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ExamMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultipleChoiceQuestion {
    #[serde(default, deserialize_with = "lenient_number")]
    pub number: u32,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub options: Vec<Choice>,
    /// Image labels (`img_N`) the question refers to.
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_text")]
    pub answer: Option<String>,
}

/// One lettered option (`A`–`D`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrueFalseQuestion {
    #[serde(default, deserialize_with = "lenient_number")]
    pub number: u32,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub statements: Vec<Statement>,
    #[serde(default)]
    pub images: Vec<String>,
}

/// One lettered statement (`a`–`d`) judged Đúng/Sai.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_bool")]
    pub answer: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShortAnswerQuestion {
    #[serde(default, deserialize_with = "lenient_number")]
    pub number: u32,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_text")]
    pub answer: Option<String>,
}

/// Answers keyed by question number. Values are kept as the model wrote them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnswerKey {
    #[serde(default)]
    pub multiple_choice: BTreeMap<String, Value>,
    #[serde(default)]
    pub true_false: BTreeMap<String, Value>,
    #[serde(default)]
    pub short_answer: BTreeMap<String, Value>,
}

impl AnswerKey {
    pub fn is_empty(&self) -> bool {
        self.multiple_choice.is_empty() && self.true_false.is_empty() && self.short_answer.is_empty()
    }
}

/// Stamped by the orchestrator after the model call; model-supplied metadata is discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamMetadata {
    pub id: String,
    pub original_filename: String,
    pub subject: Subject,
    pub pipeline_version: String,
    pub created_at: DateTime<Utc>,
    pub model: String,
    #[serde(default)]
    pub timings: StageTimings,
}

impl ExamDocument {
    /// Deserialise a repaired model response. Any `metadata` the model wrote is dropped.
    pub fn from_value(mut value: Value) -> Result<Self, ExamError> {
        match &mut value {
            Value::Object(map) => {
                map.remove("metadata");
            }
            other => {
                return Err(ExamError::SchemaMismatch(format!(
                    "expected a JSON object, got {}",
                    json_kind(other)
                )))
            }
        }
        serde_json::from_value(value).map_err(|e| ExamError::SchemaMismatch(e.to_string()))
    }

    /// Questions across all three sections.
    pub fn question_count(&self) -> usize {
        self.multiple_choice.len() + self.true_false.len() + self.short_answer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.question_count() == 0
    }

    /// Replace whatever metadata the document carries.
    pub fn stamp(&mut self, metadata: ExamMetadata) {
        self.metadata = Some(metadata);
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// `1`, `"1"`, `"Câu 1"` and `null` all read as a question number (null → 0).
fn lenient_number<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(0),
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| D::Error::custom(format!("invalid question number {}", n))),
        Value::String(s) => {
            let digits: String = s.chars().filter(char::is_ascii_digit).collect();
            if digits.is_empty() {
                Ok(0)
            } else {
                digits
                    .parse()
                    .map_err(|_| D::Error::custom(format!("invalid question number {:?}", s)))
            }
        }
        other => Err(D::Error::custom(format!("invalid question number {}", other))),
    }
}

/// Strings pass through; numbers and booleans are written out; null is absent.
fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

/// `true`, `"Đúng"`, `"Đ"` read as true; `false`, `"Sai"`, `"S"` as false; anything else is absent.
fn lenient_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => Some(b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "đúng" | "đ" | "dung" => Some(true),
            "false" | "sai" | "s" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_sections_default_empty() {
        let doc = ExamDocument::from_value(json!({"multiple_choice": []})).unwrap();
        assert!(doc.is_empty());
        assert!(doc.answer_key.is_none());
    }

    #[test]
    fn lenient_fields() {
        let doc = ExamDocument::from_value(json!({
            "multiple_choice": [{
                "number": "Câu 3",
                "content": "Tính $\\frac{1}{2} + \\frac{1}{2}$",
                "options": [{"label": "A", "content": "1"}, {"label": "B", "content": "2"}],
                "answer": "A",
                "extra": "ignored"
            }],
            "short_answer": [{"number": 1, "content": "Giá trị?", "answer": 2.5}]
        }))
        .unwrap();
        assert_eq!(doc.multiple_choice[0].number, 3);
        assert_eq!(doc.multiple_choice[0].options.len(), 2);
        assert_eq!(doc.short_answer[0].answer.as_deref(), Some("2.5"));
        assert_eq!(doc.question_count(), 2);
    }

    #[test]
    fn statement_answers_accept_vietnamese_words() {
        let doc = ExamDocument::from_value(json!({
            "true_false": [{
                "number": 1,
                "content": "Xét hàm số $y = x^3$",
                "statements": [
                    {"label": "a", "content": "p", "answer": "Đúng"},
                    {"label": "b", "content": "q", "answer": "S"},
                    {"label": "c", "content": "r", "answer": "true"},
                    {"label": "d", "content": "s", "answer": false},
                    {"label": "e", "content": "t", "answer": " đ "},
                    {"label": "f", "content": "u", "answer": "SAI"},
                    {"label": "g", "content": "v", "answer": "không rõ"},
                    {"label": "h", "content": "w", "answer": 1},
                    {"label": "i", "content": "x"}
                ]
            }]
        }))
        .unwrap();
        let answers: Vec<Option<bool>> =
            doc.true_false[0].statements.iter().map(|s| s.answer).collect();
        assert_eq!(
            answers,
            [
                Some(true),
                Some(false),
                Some(true),
                Some(false),
                Some(true),
                Some(false),
                None,
                None,
                None
            ]
        );
    }

    #[test]
    fn non_object_is_schema_mismatch() {
        let err = ExamDocument::from_value(json!([1, 2])).unwrap_err();
        assert!(err.to_string().contains("an array"));
    }

    #[test]
    fn wrong_section_type_is_schema_mismatch() {
        assert!(matches!(
            ExamDocument::from_value(json!({"true_false": "none"})),
            Err(ExamError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn stamp_overwrites_model_metadata() {
        let mut doc =
            ExamDocument::from_value(json!({"metadata": {"subject": "Toán 12"}, "short_answer": []}))
                .unwrap();
        assert!(doc.metadata.is_none());
        let meta = ExamMetadata {
            id: "exam_20260101000000_abcdEFGH".into(),
            original_filename: "de.docx".into(),
            subject: Subject::Math,
            pipeline_version: "0.3.0".into(),
            created_at: Utc::now(),
            model: "sonnet".into(),
            timings: StageTimings::default(),
        };
        doc.stamp(meta.clone());
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["metadata"]["subject"], "math");
        assert_eq!(json["metadata"]["id"], "exam_20260101000000_abcdEFGH");
        // canonical shape always has all three sections
        assert!(json["true_false"].as_array().unwrap().is_empty());
        assert!(json.get("answer_key").is_none());
    }
}
