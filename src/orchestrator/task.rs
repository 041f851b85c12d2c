use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::runner::{ParsedError, RunResult, parse_error};

/// Lifecycle of a task.
///
/// `idle -> running -> (pending_approval | error)`, then
/// `pending_approval | error -> done` through apply or reject. A task never
/// returns to `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Running,
    PendingApproval,
    Error,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Running => "running",
            TaskStatus::PendingApproval => "pending_approval",
            TaskStatus::Error => "error",
            TaskStatus::Done => "done",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    Edit,
    AutoFix,
}

impl std::fmt::Display for TaskMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskMode::Edit => write!(f, "edit"),
            TaskMode::AutoFix => write!(f, "auto_fix"),
        }
    }
}

/// A staged file change. `old_content` is `None` when the file is new.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedChange {
    pub path: String,
    pub language: String,
    pub old_content: Option<String>,
    pub new_content: String,
}

impl ProposedChange {
    pub fn is_new_file(&self) -> bool {
        self.old_content.is_none()
    }

    /// Added and removed line counts, for display.
    pub fn line_delta(&self) -> (usize, usize) {
        let old: Vec<&str> = self.old_content.as_deref().unwrap_or("").lines().collect();
        let new: Vec<&str> = self.new_content.lines().collect();
        let added = new.iter().filter(|l| !old.contains(l)).count();
        let removed = old.iter().filter(|l| !new.contains(l)).count();
        (added, removed)
    }
}

/// Captured outcome of the runs made in one fix pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationRun {
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed_error: Option<ParsedError>,
    /// Normalized error text compared between passes. `None` for a clean run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl IterationRun {
    pub fn from_result(result: &RunResult) -> Self {
        let parsed_error = if result.is_error() {
            parse_error(&result.stderr, result.error.as_deref())
        } else {
            None
        };
        Self {
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            exit_code: result.exit_code,
            error: result.error.clone(),
            parsed_error,
            signature: crate::runner::error_signature(result),
        }
    }

    pub fn is_error(&self) -> bool {
        self.signature.is_some()
    }

    /// One-line description of the failure, if any.
    pub fn headline(&self) -> Option<String> {
        if !self.is_error() {
            return None;
        }
        self.parsed_error
            .as_ref()
            .map(ParsedError::headline)
            .or_else(|| self.error.clone())
            .or_else(|| self.signature.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixIteration {
    pub i: u32,
    pub coder_notes: String,
    pub reviewer_notes: String,
    pub run: IterationRun,
    /// Paths written into the working copy during this pass.
    #[serde(default)]
    pub changed: Vec<String>,
}

/// Why the auto-fix loop ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    /// The last run was clean.
    Clean,
    /// The coder proposed nothing while the program was already clean.
    NothingToDo,
    /// The coder proposed nothing while the last run failed.
    NoEdits,
    /// The same normalized error came back.
    RepeatedError { signature: String },
    /// Iteration budget used up with the program still failing.
    MaxIterations,
}

impl StopReason {
    pub fn converged(&self) -> bool {
        matches!(self, StopReason::Clean | StopReason::NothingToDo)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    pub mode: TaskMode,
    pub goal: String,
    pub focus_paths: Vec<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub review_notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub proposed: Vec<ProposedChange>,
    /// Run made before the first fix pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<IterationRun>,
    #[serde(default)]
    pub iterations: Vec<FixIteration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_item_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(goal: impl Into<String>, focus_paths: Vec<String>, mode: TaskMode) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            status: TaskStatus::Idle,
            mode,
            goal: goal.into(),
            focus_paths,
            notes: String::new(),
            review_notes: String::new(),
            error: None,
            proposed: Vec::new(),
            baseline: None,
            iterations: Vec::new(),
            stop_reason: None,
            tokens_used: 0,
            workspace_id: None,
            memory_item_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == TaskStatus::PendingApproval
    }

    /// The most recent run: last iteration, else the baseline.
    pub fn last_run(&self) -> Option<&IterationRun> {
        self.iterations.last().map(|it| &it.run).or(self.baseline.as_ref())
    }

    pub fn proposed_paths(&self) -> Vec<String> {
        self.proposed.iter().map(|c| c.path.clone()).collect()
    }

    pub fn duration_ms(&self) -> u64 {
        (self.updated_at - self.created_at).num_milliseconds().max(0) as u64
    }
}
