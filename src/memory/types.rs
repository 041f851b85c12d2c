use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Fail,
    Partial,
    Cancelled,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Fail => "fail",
            Outcome::Partial => "partial",
            Outcome::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Outcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "success" => Ok(Outcome::Success),
            "fail" | "failure" | "failed" => Ok(Outcome::Fail),
            "partial" => Ok(Outcome::Partial),
            "cancelled" | "canceled" => Ok(Outcome::Cancelled),
            _ => anyhow::bail!(
                "Invalid outcome '{}'. Valid values: success, fail, partial, cancelled",
                s
            ),
        }
    }
}

/// Coarse task category, inferred from the goal and summary text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Bugfix,
    Feature,
    Refactor,
    Test,
    Docs,
    Style,
    Performance,
    #[default]
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Bugfix => "bugfix",
            Category::Feature => "feature",
            Category::Refactor => "refactor",
            Category::Test => "test",
            Category::Docs => "docs",
            Category::Style => "style",
            Category::Performance => "performance",
            Category::Other => "other",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bugfix" => Ok(Category::Bugfix),
            "feature" => Ok(Category::Feature),
            "refactor" => Ok(Category::Refactor),
            "test" => Ok(Category::Test),
            "docs" => Ok(Category::Docs),
            "style" => Ok(Category::Style),
            "performance" => Ok(Category::Performance),
            "other" => Ok(Category::Other),
            _ => anyhow::bail!("Invalid category '{}'", s),
        }
    }
}

/// One remembered task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMemoryItem {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub goal: String,
    #[serde(default)]
    pub focus_paths: Vec<String>,
    pub outcome: Outcome,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub category: Category,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub iterations: u32,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub files_modified: Vec<String>,
}

/// Input to `TaskMemory::add`. Category and tags are derived when absent.
#[derive(Debug, Clone, Default)]
pub struct NewMemoryItem {
    pub goal: String,
    pub focus_paths: Vec<String>,
    pub outcome: Option<Outcome>,
    pub summary: String,
    pub category: Option<Category>,
    /// Stored as given; `extra_tags` is ignored when set.
    pub tags: Option<Vec<String>>,
    /// Appended to the inferred tags.
    pub extra_tags: Vec<String>,
    pub duration_ms: u64,
    pub iterations: u32,
    pub tokens_used: u64,
    pub files_modified: Vec<String>,
}

/// Partial update for `TaskMemory::update`.
#[derive(Debug, Clone, Default)]
pub struct MemoryPatch {
    pub outcome: Option<Outcome>,
    pub summary: Option<String>,
    pub tags: Option<Vec<String>>,
    pub category: Option<Category>,
    pub duration_ms: Option<u64>,
    pub iterations: Option<u32>,
    pub tokens_used: Option<u64>,
    pub files_modified: Option<Vec<String>>,
}

/// Criteria for `TaskMemory::search`. Every set field must match.
#[derive(Debug, Clone, Default)]
pub struct MemoryFilter {
    pub query: Option<String>,
    pub outcome: Option<Outcome>,
    /// Matches items carrying at least one of these tags.
    pub tags_any: Vec<String>,
    pub category: Option<Category>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub min_duration_ms: Option<u64>,
    pub max_duration_ms: Option<u64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredItem {
    pub item: TaskMemoryItem,
    pub score: f64,
}

/// Aggregates derived from the current items.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStatistics {
    pub total: usize,
    pub by_outcome: BTreeMap<Outcome, usize>,
    pub by_category: BTreeMap<Category, usize>,
    pub average_duration_ms: f64,
    pub total_tokens: u64,
    pub top_files: Vec<(String, usize)>,
    pub top_tags: Vec<(String, usize)>,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImportMode {
    #[default]
    Merge,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImportReport {
    pub added: usize,
    pub updated: usize,
    pub skipped: usize,
}

/// On-disk and export envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryExport {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub items: Vec<TaskMemoryItem>,
}
