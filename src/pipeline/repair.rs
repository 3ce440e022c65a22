//! Response repair: turn the AI CLI's text answer into a JSON value.
//!
//! The model is told to reply with bare JSON, and mostly does. The failures
//! seen in practice are all mechanical:
//!
//! - the object wrapped in a ` ```json ... ``` ` fence;
//! - a trailing comma before `]` or `}`;
//! - LaTeX written with single backslashes (`"\frac{1}{2}"`), which strict
//!   JSON reads as a form feed followed by `rac{1}{2}` or rejects outright;
//! - a sentence of prose before or after the object.
//!
//! Rules run in that order on the whole text, then a strict parse. If that
//! fails, the span from the first `{` to the last `}` is parsed instead.

use crate::error::ExamError;
use crate::pipeline::process::truncate;
use serde_json::Value;
use tracing::debug;

/// Longest excerpt of a bad response carried by the error.
const PREVIEW_CHARS: usize = 200;

/// Repair and parse a model response.
pub fn parse_model_json(raw: &str) -> Result<Value, ExamError> {
    let cleaned = repair(raw);

    let first_error = match serde_json::from_str::<Value>(&cleaned) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    if let Some(span) = outer_object(&cleaned) {
        if span.len() < cleaned.len() {
            debug!("Retrying parse on the outer object span ({} bytes)", span.len());
            if let Ok(value) = serde_json::from_str::<Value>(span) {
                return Ok(value);
            }
        }
    }

    Err(ExamError::MalformedResponse {
        reason: first_error.to_string(),
        // the marker counts toward the limit
        preview: truncate(raw, PREVIEW_CHARS - 1),
    })
}

/// All textual rules, in order. Idempotent.
pub fn repair(raw: &str) -> String {
    let s = strip_code_fence(raw);
    let s = remove_trailing_commas(s);
    escape_lone_backslashes(&s)
}

// ── Rule 1: Strip one outer code fence ───────────────────────────────────────

fn strip_code_fence(input: &str) -> &str {
    let mut s = input.trim();
    if let Some(rest) = s.strip_prefix("```") {
        // language tag, if any
        let tag_len = rest
            .find(|c: char| !c.is_ascii_alphanumeric())
            .unwrap_or(rest.len());
        s = &rest[tag_len..];
    }
    if let Some(rest) = s.trim_end().strip_suffix("```") {
        s = rest;
    }
    s.trim()
}

// ── Rule 2: Trailing commas ──────────────────────────────────────────────────

/// Drop a comma followed (after whitespace) by `}` or `]`, outside strings only.
fn remove_trailing_commas(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut chars = input.char_indices();
    while let Some((i, c)) = chars.next() {
        if in_string {
            out.push(c);
            match c {
                '\\' => {
                    if let Some((_, next)) = chars.next() {
                        out.push(next);
                    }
                }
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        if c == ',' {
            let closes = input[i + 1..]
                .trim_start()
                .starts_with(|n: char| n == '}' || n == ']');
            if closes {
                continue;
            }
        }
        if c == '"' {
            in_string = true;
        }
        out.push(c);
    }
    out
}

// ── Rule 3: Lone backslashes ─────────────────────────────────────────────────

/// Double every backslash that is not already part of a `\\` pair or a
/// `\"` quote escape.
///
/// The result is that JSON decoding yields exactly the characters the model
/// typed: `\frac` stays `\frac`, `\\frac` stays `\frac`, and `\n` becomes a
/// literal backslash followed by `n` (LaTeX `\nu`, `\neq` depend on this).
fn escape_lone_backslashes(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + input.len() / 8);
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('\\') => {
                chars.next();
                out.push_str("\\\\");
            }
            Some('"') => {
                chars.next();
                out.push_str("\\\"");
            }
            _ => out.push_str("\\\\"),
        }
    }
    out
}

// ── Fallback: outer object span ──────────────────────────────────────────────

fn outer_object(input: &str) -> Option<&str> {
    let start = input.find('{')?;
    let end = input.rfind('}')?;
    (end > start).then(|| &input[start..=end])
}
