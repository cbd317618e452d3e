use regex::Regex;
use std::sync::LazyLock;

use crate::error::AtlasError;

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

static TRAILING_PUNCT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]+$").expect("valid punctuation regex"));

/// Accepted insight length in characters, after normalization.
pub const MIN_INSIGHT_CHARS: usize = 8;
pub const MAX_INSIGHT_CHARS: usize = 320;

/// Display form of a submission: single-spaced, trimmed, ending in terminal punctuation.
pub fn normalize_insight_text(text: &str) -> String {
    let mut cleaned = WHITESPACE_RE.replace_all(text, " ").trim().to_string();
    if !cleaned.is_empty() && !cleaned.ends_with(['.', '!', '?']) {
        cleaned.push('.');
    }
    cleaned
}

/// Deduplication key: lowercased, single-spaced, trailing `.!?` removed.
/// Two submissions with the same key are the same insight.
pub fn insight_text_key(text: &str) -> String {
    let lowered = text.trim().to_lowercase();
    let collapsed = WHITESPACE_RE.replace_all(&lowered, " ");
    TRAILING_PUNCT_RE
        .replace(&collapsed, "")
        .trim_end()
        .to_string()
}

/// Normalize and length-check a submission.
pub fn validate_insight_text(text: &str) -> Result<String, AtlasError> {
    let normalized = normalize_insight_text(text);
    let chars = normalized.chars().count();
    if !(MIN_INSIGHT_CHARS..=MAX_INSIGHT_CHARS).contains(&chars) {
        return Err(AtlasError::Validation(format!(
            "insight must be between {MIN_INSIGHT_CHARS} and {MAX_INSIGHT_CHARS} characters, got {chars}"
        )));
    }
    Ok(normalized)
}
