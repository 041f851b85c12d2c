use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-file metadata. Only one file in a snapshot may carry `entry = true`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    #[serde(default)]
    pub entry: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceFile {
    pub path: String,
    pub language: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: FileMetadata,
}

impl WorkspaceFile {
    pub fn new(path: impl Into<String>, language: impl Into<String>, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            path: path.into(),
            language: language.into(),
            content: content.into(),
            created_at: now,
            updated_at: now,
            metadata: FileMetadata::default(),
        }
    }

    pub fn is_entry(&self) -> bool {
        self.metadata.entry
    }
}

/// A named, versionless set of files keyed by path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSnapshot {
    pub id: String,
    pub name: String,
    pub files: BTreeMap<String, WorkspaceFile>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub template_id: String,
}

impl WorkspaceSnapshot {
    pub fn entry_file(&self) -> Option<&WorkspaceFile> {
        self.files.values().find(|f| f.is_entry())
    }

    pub fn entry_path(&self) -> Option<&str> {
        self.entry_file().map(|f| f.path.as_str())
    }

    /// Path -> content view, the shape the runner consumes.
    pub fn contents(&self) -> BTreeMap<String, String> {
        self.files
            .iter()
            .map(|(path, file)| (path.clone(), file.content.clone()))
            .collect()
    }

    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            template_id: self.template_id.clone(),
            file_count: self.files.len(),
            updated_at: self.updated_at,
        }
    }
}

/// Row of the store's listing index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSummary {
    pub id: String,
    pub name: String,
    pub template_id: String,
    pub file_count: usize,
    pub updated_at: DateTime<Utc>,
}

// ── Templates ────────────────────────────────────────────────────────

/// A starter file set used by `WorkspaceModel::create`.
#[derive(Debug, Clone, Copy)]
pub struct Template {
    pub id: &'static str,
    pub description: &'static str,
    pub entry: Option<&'static str>,
    pub files: &'static [(&'static str, &'static str)],
}

const NODE_MAIN: &str = r#"const { greet } = require('./util');

console.log(greet('world'));
"#;

const NODE_UTIL: &str = r#"function greet(name) {
  return `Hello, ${name}!`;
}

module.exports = { greet };
"#;

const PYTHON_MAIN: &str = r#"def greet(name):
    return f"Hello, {name}!"


if __name__ == "__main__":
    print(greet("world"))
"#;

pub const TEMPLATES: &[Template] = &[
    Template {
        id: "blank",
        description: "Empty workspace",
        entry: None,
        files: &[],
    },
    Template {
        id: "node",
        description: "Two-module JavaScript project",
        entry: Some("main.js"),
        files: &[("main.js", NODE_MAIN), ("util.js", NODE_UTIL)],
    },
    Template {
        id: "python",
        description: "Single-file Python script",
        entry: Some("main.py"),
        files: &[("main.py", PYTHON_MAIN)],
    },
];

pub fn find_template(id: &str) -> Option<&'static Template> {
    TEMPLATES.iter().find(|t| t.id == id)
}

// ── Languages ────────────────────────────────────────────────────────

/// Infer a language tag from a file extension. Unknown extensions map to
/// `plaintext`.
pub fn language_for_path(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("js" | "mjs" | "cjs" | "jsx") => "javascript",
        Some("ts" | "tsx") => "typescript",
        Some("py") => "python",
        Some("rb") => "ruby",
        Some("sh") => "shell",
        Some("json") => "json",
        Some("html" | "htm") => "html",
        Some("css") => "css",
        Some("md") => "markdown",
        Some("toml") => "toml",
        Some("yaml" | "yml") => "yaml",
        _ => "plaintext",
    }
}

/// Normalize a workspace path: forward slashes, no leading `./` or `/`, and no
/// `..` segments. Returns `None` for paths that would escape the workspace.
pub fn normalize_path(path: &str) -> Option<String> {
    let path = path.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            s => parts.push(s),
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
