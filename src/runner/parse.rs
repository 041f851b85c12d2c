//! Structured error extraction from run output.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::types::RunResult;

static ERROR_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:Uncaught\s+)?([A-Z][A-Za-z0-9_]*(?:Error|Exception|Interrupt|Exit))(?::\s*(.*))?\s*$")
        .unwrap()
});

static JS_LOCATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(?([\w./\-\[\]]+\.[A-Za-z]+):(\d+):(\d+)\)?").unwrap());

static PY_LOCATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"File "([^"]+)", line (\d+)"#).unwrap());

static POSITION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r":\d+(?::\d+)?").unwrap());

static PY_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"line \d+").unwrap());

static TEMP_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:/private)?/(?:tmp|var/folders)/[^\s:)]*").unwrap());

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedError {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

impl ParsedError {
    /// `Kind: message`, the form fed back to the fix coder.
    pub fn headline(&self) -> String {
        if self.message.is_empty() {
            self.kind.clone()
        } else {
            format!("{}: {}", self.kind, self.message)
        }
    }
}

/// Parse the most relevant error out of `stderr` and the driver `error`.
///
/// A timeout or driver error wins over stderr content. Python tracebacks
/// report the last error line; everything else reports the first.
pub fn parse_error(stderr: &str, error: Option<&str>) -> Option<ParsedError> {
    if let Some(error) = error.filter(|e| !e.trim().is_empty()) {
        let kind = if error.starts_with("Timeout after") {
            "Timeout"
        } else {
            "Error"
        };
        let mut parsed = from_stderr(error).unwrap_or_else(|| ParsedError {
            kind: kind.to_string(),
            message: error.trim().to_string(),
            file: None,
            line: None,
            column: None,
        });
        if parsed.file.is_none() {
            locate(stderr, &mut parsed);
        }
        return Some(parsed);
    }

    if stderr.trim().is_empty() {
        return None;
    }
    from_stderr(stderr).or_else(|| {
        let first = stderr.lines().map(str::trim).find(|l| !l.is_empty())?;
        Some(ParsedError {
            kind: "Error".to_string(),
            message: first.to_string(),
            file: None,
            line: None,
            column: None,
        })
    })
}

fn from_stderr(text: &str) -> Option<ParsedError> {
    let is_traceback = text.contains("Traceback (most recent call last)");
    let mut matches = ERROR_LINE.captures_iter(text);
    let caps = if is_traceback { matches.last()? } else { matches.next()? };

    let mut parsed = ParsedError {
        kind: caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default(),
        message: caps.get(2).map(|m| m.as_str().trim().to_string()).unwrap_or_default(),
        file: None,
        line: None,
        column: None,
    };
    locate(text, &mut parsed);
    Some(parsed)
}

fn locate(text: &str, parsed: &mut ParsedError) {
    if let Some(caps) = PY_LOCATION.captures_iter(text).last() {
        parsed.file = Some(caps[1].to_string());
        parsed.line = caps[2].parse().ok();
        return;
    }
    if let Some(caps) = JS_LOCATION
        .captures_iter(text)
        .find(|c| !c[1].starts_with("node:") && !c[1].contains("internal/"))
    {
        parsed.file = Some(caps[1].to_string());
        parsed.line = caps[2].parse().ok();
        parsed.column = caps[3].parse().ok();
    }
}

/// Canonical form of an error message used to detect repeats: positions and
/// temp paths stripped, whitespace collapsed.
pub fn normalize(message: &str) -> String {
    let text = TEMP_PATH.replace_all(message, "<tmp>");
    let text = POSITION.replace_all(&text, "");
    let text = PY_LINE.replace_all(&text, "line");
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

/// Normalized signature of a failed run, or `None` for a clean run.
pub fn error_signature(result: &RunResult) -> Option<String> {
    if !result.is_error() {
        return None;
    }
    let headline = parse_error(&result.stderr, result.error.as_deref())
        .map(|p| p.headline())
        .unwrap_or_else(|| format!("exit code {}", result.exit_code.unwrap_or(-1)));
    Some(normalize(&headline))
}
