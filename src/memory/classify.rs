//! Keyword-driven category and tag inference.

use super::types::Category;

/// Ordered category table. The first category with a keyword that prefixes
/// any word of the text wins.
const CATEGORY_KEYWORDS: &[(Category, &[&str])] = &[
    (Category::Bugfix, &["fix", "bug", "error", "crash", "broken", "repair", "patch", "exception"]),
    (Category::Test, &["test", "spec", "coverage", "assert"]),
    (Category::Refactor, &["refactor", "cleanup", "rename", "restructure", "simplif", "extract", "reorganiz"]),
    (Category::Performance, &["perf", "optimiz", "speed", "faster", "slow", "cache", "latency", "memoiz"]),
    (Category::Docs, &["doc", "readme", "comment", "jsdoc", "docstring"]),
    (Category::Style, &["style", "css", "format", "lint", "layout", "color", "colour", "theme", "indent"]),
    (Category::Feature, &["add", "implement", "create", "feature", "support", "introduce", "build", "new"]),
];

/// Whole-word keyword → tag table.
const TAG_KEYWORDS: &[(&str, &str)] = &[
    ("api", "api"),
    ("endpoint", "api"),
    ("async", "async"),
    ("await", "async"),
    ("promise", "async"),
    ("log", "logging"),
    ("logging", "logging"),
    ("logger", "logging"),
    ("console", "logging"),
    ("dom", "dom"),
    ("html", "html"),
    ("css", "css"),
    ("json", "json"),
    ("regex", "regex"),
    ("http", "http"),
    ("fetch", "http"),
    ("request", "http"),
    ("auth", "auth"),
    ("login", "auth"),
    ("database", "database"),
    ("sql", "database"),
    ("cache", "cache"),
    ("test", "testing"),
    ("tests", "testing"),
    ("typeerror", "runtime-error"),
    ("referenceerror", "runtime-error"),
    ("syntaxerror", "syntax-error"),
    ("timeout", "timeout"),
];

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Infer a category from free text; `Other` when nothing matches.
pub fn classify(text: &str) -> Category {
    let words = words(text);
    CATEGORY_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| words.iter().any(|w| w.starts_with(k))))
        .map(|(category, _)| *category)
        .unwrap_or_default()
}

fn tag_for_extension(path: &str) -> &'static [&'static str] {
    let ext = path.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("js" | "mjs" | "cjs") => &["javascript"],
        Some("jsx") => &["javascript", "react"],
        Some("ts") => &["typescript"],
        Some("tsx") => &["typescript", "react"],
        Some("py") => &["python"],
        Some("css" | "scss") => &["css"],
        Some("html" | "htm") => &["html"],
        Some("json") => &["json"],
        Some("md") => &["docs"],
        _ => &[],
    }
}

fn is_test_path(path: &str) -> bool {
    let lower = path.to_lowercase();
    lower.contains(".test.")
        || lower.contains(".spec.")
        || lower.starts_with("tests/")
        || lower.contains("/tests/")
        || lower.contains("__tests__")
        || lower.rsplit('/').next().is_some_and(|n| n.starts_with("test_"))
}

/// Tags from file extensions in `paths` plus keyword hits in `text`, sorted
/// and deduplicated.
pub fn extract_tags(paths: &[String], text: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for path in paths {
        for tag in tag_for_extension(path) {
            tags.push(tag.to_string());
        }
        if is_test_path(path) {
            tags.push("testing".to_string());
        }
    }

    let words = words(text);
    for (keyword, tag) in TAG_KEYWORDS {
        if words.iter().any(|w| w == keyword) {
            tags.push(tag.to_string());
        }
    }

    tags.sort();
    tags.dedup();
    tags
}
