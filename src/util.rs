//! Shared utility functions for the codeloop crate.

/// Extract a JSON object from text that may contain other content.
///
/// Tries, in order: the whole trimmed text, a ```json fenced block, then the
/// first balanced `{...}` object. Brace counting skips over string literals so
/// code carried inside JSON strings does not throw off the depth.
pub fn extract_json_object(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') && balanced_end(trimmed, 0) == Some(trimmed.len()) {
        return Some(trimmed.to_string());
    }

    if let Some(start) = trimmed.find("```json") {
        let after_marker = &trimmed[start + 7..];
        if let Some(end) = after_marker.rfind("```") {
            let block = after_marker[..end].trim();
            if block.starts_with('{') {
                return Some(block.to_string());
            }
        }
    }

    let start = trimmed.find('{')?;
    let end = balanced_end(trimmed, start)?;
    Some(trimmed[start..end].to_string())
}

/// Byte offset one past the `}` closing the object that opens at `start`.
fn balanced_end(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Truncate `text` to at most `max_chars` characters, appending an ellipsis
/// when something was cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", kept)
}
