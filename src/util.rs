//! Small string helpers shared across the crate.

/// Truncate a string to at most `max_chars` characters, appending an
/// ellipsis when content is dropped. Safe on multi-byte text.
pub fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let kept: String = s.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{kept}…")
}

/// Keep only the last `max_chars` characters of `text`, marking the cut.
///
/// Used for feeding command output back into prompts: the end of a failing
/// build log is almost always the useful part.
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let skip = total - max_chars;
    let tail: String = text.chars().skip(skip).collect();
    format!("[... {skip} chars truncated ...]{tail}")
}

/// Reduce an arbitrary label to a single safe path component.
///
/// Anything outside `[A-Za-z0-9._-]` becomes `-`; empty input gets a
/// placeholder so callers can always join the result onto a directory.
pub fn sanitize_component(input: &str) -> String {
    let cleaned: String = input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.').to_string();
    if trimmed.is_empty() {
        "task".to_string()
    } else {
        trimmed
    }
}
