use regex::Regex;
use std::sync::LazyLock;

static BOLD_HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)\*\*.*?\*\*").unwrap());

pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json").trim_end_matches("```").trim().to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```").trim_end_matches("```").trim().to_string()
    } else {
        s.to_string()
    }
}

/// Picks the part of a streamed reasoning buffer worth showing: everything
/// from the last `**heading**` on, or failing that the last paragraph (with
/// the one before it when the last is shorter than 50 characters).
pub fn summarize_thought(buffer: &str) -> String {
    if let Some(last) = BOLD_HEADING.find_iter(buffer).last() {
        return buffer[last.start()..].to_string();
    }

    let blocks: Vec<&str> = buffer.split("\n\n").collect();
    let last = blocks.last().copied().unwrap_or("");
    if last.chars().count() < 50 && blocks.len() > 1 {
        format!("{}\n\n{}", blocks[blocks.len() - 2], last)
    } else {
        last.to_string()
    }
}

/// First `max` characters of `s`, for log lines.
pub fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
