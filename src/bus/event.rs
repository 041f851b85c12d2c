use serde::{Deserialize, Serialize};

use crate::memory::Outcome;
use crate::orchestrator::{TaskMode, TaskStatus};
use crate::runner::OutputStream;

// ── Event payloads ───────────────────────────────────────────────────

/// Every notification that travels over the bus.
///
/// The wire form is `{"type": "<kind>", "data": {...}}` so the same enum can
/// be forwarded verbatim to async observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    // Workspace lifecycle
    #[serde(rename = "workspace:created")]
    WorkspaceCreated {
        workspace_id: String,
        name: String,
        template_id: String,
    },
    #[serde(rename = "workspace:loaded")]
    WorkspaceLoaded { workspace_id: String },
    #[serde(rename = "workspace:changed")]
    WorkspaceChanged {
        workspace_id: String,
        change: WorkspaceChange,
        paths: Vec<String>,
    },
    #[serde(rename = "workspace:saved")]
    WorkspaceSaved { workspace_id: String },

    // Sandboxed runs
    #[serde(rename = "runner:started")]
    RunStarted { run_id: String, entry: String },
    #[serde(rename = "runner:output")]
    RunOutput {
        run_id: String,
        stream: OutputStream,
        text: String,
    },
    #[serde(rename = "runner:exit")]
    RunExited { run_id: String, code: i32 },
    #[serde(rename = "runner:error")]
    RunFailed { run_id: String, error: String },

    // Agent tasks
    #[serde(rename = "agents:taskCreated")]
    TaskCreated {
        task_id: String,
        goal: String,
        mode: TaskMode,
    },
    #[serde(rename = "agents:taskUpdated")]
    TaskUpdated { task_id: String, status: TaskStatus },
    #[serde(rename = "agents:iteration")]
    TaskIteration {
        task_id: String,
        iteration: u32,
        error: Option<String>,
    },
    #[serde(rename = "agents:notification")]
    Notification {
        level: NotificationLevel,
        message: String,
        task_id: Option<String>,
    },

    // Task memory
    #[serde(rename = "memory:added")]
    MemoryAdded { item_id: String, outcome: Outcome },
}

/// What kind of mutation a `workspace:changed` event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceChange {
    Upserted,
    Renamed,
    Deleted,
    EntryChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

// ── Event kinds ──────────────────────────────────────────────────────

/// Discriminant of [`Event`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    WorkspaceCreated,
    WorkspaceLoaded,
    WorkspaceChanged,
    WorkspaceSaved,
    RunStarted,
    RunOutput,
    RunExited,
    RunFailed,
    TaskCreated,
    TaskUpdated,
    TaskIteration,
    Notification,
    MemoryAdded,
}

impl EventKind {
    pub fn all() -> &'static [EventKind] {
        &[
            EventKind::WorkspaceCreated,
            EventKind::WorkspaceLoaded,
            EventKind::WorkspaceChanged,
            EventKind::WorkspaceSaved,
            EventKind::RunStarted,
            EventKind::RunOutput,
            EventKind::RunExited,
            EventKind::RunFailed,
            EventKind::TaskCreated,
            EventKind::TaskUpdated,
            EventKind::TaskIteration,
            EventKind::Notification,
            EventKind::MemoryAdded,
        ]
    }

    /// The `type` tag this kind carries on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::WorkspaceCreated => "workspace:created",
            EventKind::WorkspaceLoaded => "workspace:loaded",
            EventKind::WorkspaceChanged => "workspace:changed",
            EventKind::WorkspaceSaved => "workspace:saved",
            EventKind::RunStarted => "runner:started",
            EventKind::RunOutput => "runner:output",
            EventKind::RunExited => "runner:exit",
            EventKind::RunFailed => "runner:error",
            EventKind::TaskCreated => "agents:taskCreated",
            EventKind::TaskUpdated => "agents:taskUpdated",
            EventKind::TaskIteration => "agents:iteration",
            EventKind::Notification => "agents:notification",
            EventKind::MemoryAdded => "memory:added",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::all()
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown event kind '{}'", s))
    }
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::WorkspaceCreated { .. } => EventKind::WorkspaceCreated,
            Event::WorkspaceLoaded { .. } => EventKind::WorkspaceLoaded,
            Event::WorkspaceChanged { .. } => EventKind::WorkspaceChanged,
            Event::WorkspaceSaved { .. } => EventKind::WorkspaceSaved,
            Event::RunStarted { .. } => EventKind::RunStarted,
            Event::RunOutput { .. } => EventKind::RunOutput,
            Event::RunExited { .. } => EventKind::RunExited,
            Event::RunFailed { .. } => EventKind::RunFailed,
            Event::TaskCreated { .. } => EventKind::TaskCreated,
            Event::TaskUpdated { .. } => EventKind::TaskUpdated,
            Event::TaskIteration { .. } => EventKind::TaskIteration,
            Event::Notification { .. } => EventKind::Notification,
            Event::MemoryAdded { .. } => EventKind::MemoryAdded,
        }
    }

    /// Task id carried by agent events, if any.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Event::TaskCreated { task_id, .. }
            | Event::TaskUpdated { task_id, .. }
            | Event::TaskIteration { task_id, .. } => Some(task_id),
            Event::Notification { task_id, .. } => task_id.as_deref(),
            _ => None,
        }
    }

    /// Run id carried by runner events, if any.
    pub fn run_id(&self) -> Option<&str> {
        match self {
            Event::RunStarted { run_id, .. }
            | Event::RunOutput { run_id, .. }
            | Event::RunExited { run_id, .. }
            | Event::RunFailed { run_id, .. } => Some(run_id),
            _ => None,
        }
    }
}
