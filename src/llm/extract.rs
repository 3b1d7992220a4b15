//! Pull JSON out of noisy model output.
//!
//! Models wrap JSON in Markdown fences, prefix it with prose, or emit
//! almost-JSON with comments and trailing commas. These helpers find the
//! payload, apply one repair pass if needed, and deserialize it.

use regex::Regex;
use serde::de::DeserializeOwned;
use std::sync::OnceLock;

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)```(?:json)?\s*([\s\S]*?)\s*```").expect("valid regex"))
}

/// Find the most likely JSON segment in `text`.
///
/// A fenced code block wins; otherwise the first balanced `[...]` or `{...}`
/// (whichever opens first) is returned.
pub fn extract_json(text: &str) -> Option<&str> {
    if let Some(caps) = fence_re().captures(text) {
        return caps.get(1).map(|m| m.as_str().trim());
    }

    let start = text.find(['[', '{'])?;
    let (open, close) = if text[start..].starts_with('[') {
        ('[', ']')
    } else {
        ('{', '}')
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        if ch == '"' {
            in_string = true;
        } else if ch == open {
            depth += 1;
        } else if ch == close {
            depth -= 1;
            if depth == 0 {
                return Some(&text[start..start + offset + ch.len_utf8()]);
            }
        }
    }
    None
}

/// Fix the most common model JSON mistakes.
pub fn repair_json(s: &str) -> String {
    static LINE_COMMENT: OnceLock<Regex> = OnceLock::new();
    static BLOCK_COMMENT: OnceLock<Regex> = OnceLock::new();
    static TRAILING_COMMA: OnceLock<Regex> = OnceLock::new();

    let line_comment = LINE_COMMENT.get_or_init(|| Regex::new(r"(?m)(^|\s)//[^\n]*$").expect("valid regex"));
    let block_comment = BLOCK_COMMENT.get_or_init(|| Regex::new(r"(?s)/\*.*?\*/").expect("valid regex"));
    let trailing_comma = TRAILING_COMMA.get_or_init(|| Regex::new(r",\s*([}\]])").expect("valid regex"));

    let trimmed = s.trim().trim_matches('`');
    let without_lines = line_comment.replace_all(trimmed, "$1");
    let without_blocks = block_comment.replace_all(&without_lines, "");
    let mut repaired = trailing_comma.replace_all(&without_blocks, "$1").into_owned();

    // single quotes only when the payload has no double quotes at all
    if repaired.contains('\'') && !repaired.contains('"') {
        repaired = repaired.replace('\'', "\"");
    }

    repaired
}

/// Extract, repair if needed, and deserialize a `T` from model output.
pub fn parse_lenient<T: DeserializeOwned>(text: &str) -> Result<T, String> {
    let candidate = extract_json(text).unwrap_or_else(|| text.trim());
    if candidate.is_empty() {
        return Err("no JSON found in model output".to_string());
    }

    match serde_json::from_str(candidate) {
        Ok(value) => Ok(value),
        Err(first) => serde_json::from_str(&repair_json(candidate))
            .map_err(|_| format!("model output is not valid JSON for the expected shape: {}", first)),
    }
}
