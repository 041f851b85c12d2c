//! Goal-driven task orchestration.
//!
//! An [`Orchestrator`] turns a natural-language goal into staged file changes:
//!
//! - [`Orchestrator::plan_focus`] picks the files a goal should touch.
//! - [`Orchestrator::run_edit_task`] runs coder and reviewer once.
//! - [`Orchestrator::run_auto_fix`] iterates coder, reviewer and the sandboxed
//!   runner on a private working copy until a stop rule fires.
//!
//! Both task flows end in `pending_approval` (or `error`). Nothing reaches the
//! workspace until [`Orchestrator::apply_changes`] is called, and only paths
//! in the task's focus set are ever proposed.

pub mod critic;
mod edit;
mod fix;
pub mod task;

pub use critic::Critic;
pub use task::{FixIteration, IterationRun, ProposedChange, StopReason, Task, TaskMode, TaskStatus};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;

use crate::agents::{self, AgentRole, FileEdit, PlannerReply, prompts};
use crate::bus::{Event, EventBus, NotificationLevel};
use crate::errors::{OrchestratorError, WorkspaceError};
use crate::llm::{CallOptions, LlmClient};
use crate::memory::{MemoryPatch, NewMemoryItem, Outcome, TaskMemory};
use crate::runner::SandboxRunner;
use crate::workspace::{DependencyGraph, WorkspaceFile, WorkspaceModel, WorkspaceSnapshot, language_for_path, normalize_path};

/// Read-only dependency files shown to the coder next to the focus set.
const MAX_CONTEXT_FILES: usize = 8;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_iters: u32,
    /// Consecutive repeats of one error tolerated before the fix loop stops.
    pub repeat_error_threshold: u32,
    pub max_focus_files: usize,
    pub test_also: bool,
    /// Past tasks injected into planner and coder prompts.
    pub memory_context: usize,
    /// Timeout for each run inside the fix loop.
    pub fix_timeout: Duration,
    pub call_options: CallOptions,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_iters: 4,
            repeat_error_threshold: 1,
            max_focus_files: 12,
            test_also: false,
            memory_context: 3,
            fix_timeout: Duration::from_millis(2500),
            call_options: CallOptions::default(),
        }
    }
}

/// Per-call options for [`Orchestrator::run_auto_fix`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixOptions {
    pub max_iters: u32,
    pub test_also: bool,
}

impl From<&OrchestratorSettings> for FixOptions {
    fn from(settings: &OrchestratorSettings) -> Self {
        Self {
            max_iters: settings.max_iters,
            test_also: settings.test_also,
        }
    }
}

/// Result of [`Orchestrator::plan_focus`].
#[derive(Debug, Clone, PartialEq)]
pub struct FocusPlan {
    pub focus_paths: Vec<String>,
    pub notes: String,
    /// True when the planner's selection was unusable and the entry file (or
    /// first file) was used instead.
    pub fallback: bool,
    pub tokens: u64,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    workspace: WorkspaceModel,
    runner: SandboxRunner,
    memory: TaskMemory,
    llm: Arc<dyn LlmClient>,
    bus: EventBus,
    settings: OrchestratorSettings,
    tasks: Mutex<HashMap<String, Task>>,
}

impl Orchestrator {
    pub fn new(
        workspace: WorkspaceModel,
        runner: SandboxRunner,
        memory: TaskMemory,
        llm: Arc<dyn LlmClient>,
        bus: EventBus,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                workspace,
                runner,
                memory,
                llm,
                bus,
                settings,
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    pub fn workspace(&self) -> &WorkspaceModel {
        &self.inner.workspace
    }

    pub fn memory(&self) -> &TaskMemory {
        &self.inner.memory
    }

    pub fn task(&self, id: &str) -> Option<Task> {
        self.lock().get(id).cloned()
    }

    /// All tasks, oldest first.
    pub fn tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.lock().values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    // ── Planning ─────────────────────────────────────────────────────

    /// Ask the planner which files `goal` should touch.
    ///
    /// The selection keeps only existing paths, deduplicated, capped at
    /// `max_focus_files`. An empty or unusable selection (including a planner
    /// failure) falls back to the entry file, then to the first file.
    pub async fn plan_focus(&self, goal: &str) -> Result<FocusPlan, OrchestratorError> {
        let snapshot = self.inner.workspace.require_current()?;
        let settings = &self.inner.settings;
        let graph = DependencyGraph::build(&snapshot);
        let memory = self.inner.memory.context_for(goal, settings.memory_context);
        let messages = prompts::planner_messages(goal, &snapshot, &graph, &memory, settings.max_focus_files);

        let (selected, notes, tokens) =
            match agents::ask::<PlannerReply>(self.inner.llm.as_ref(), AgentRole::Planner, &messages, &settings.call_options)
                .await
            {
                Ok(call) => (
                    select_focus(&snapshot, &call.reply.focus_paths, settings.max_focus_files),
                    call.reply.notes,
                    call.tokens,
                ),
                Err(e) => {
                    tracing::warn!(error = %e, "planner failed; falling back to entry file");
                    (Vec::new(), String::new(), 0)
                }
            };

        if !selected.is_empty() {
            tracing::info!(focus = ?selected, "focus planned");
            return Ok(FocusPlan {
                focus_paths: selected,
                notes,
                fallback: false,
                tokens,
            });
        }

        let fallback: Vec<String> = snapshot
            .entry_path()
            .map(str::to_string)
            .or_else(|| snapshot.files.keys().next().cloned())
            .into_iter()
            .collect();
        tracing::info!(focus = ?fallback, "planner selection unusable; using fallback focus");
        Ok(FocusPlan {
            focus_paths: fallback,
            notes,
            fallback: true,
            tokens,
        })
    }

    // ── Approval gate ────────────────────────────────────────────────

    /// Write the staged changes of a `pending_approval` task into the
    /// workspace, limited to `paths` when given, then mark it `done`.
    ///
    /// Returns `Ok(false)` without touching anything when the task is in any
    /// other state. Every selected path and the current workspace are checked
    /// before the first write; a failed check leaves the workspace untouched
    /// and the task in `error`.
    pub fn apply_changes(&self, id: &str, paths: Option<&[String]>) -> Result<bool, OrchestratorError> {
        let Some(task) = self.claim_for_finish(id, &[TaskStatus::PendingApproval])? else {
            return Ok(false);
        };

        let selected: Vec<&ProposedChange> = task
            .proposed
            .iter()
            .filter(|c| paths.is_none_or(|ps| ps.iter().any(|p| *p == c.path)))
            .collect();

        if let Err(err) = self.check_applicable(&selected) {
            self.fail_task(id, &err);
            return Err(err);
        }

        for change in &selected {
            if let Err(e) = self
                .inner
                .workspace
                .upsert_file(&change.path, &change.language, &change.new_content)
            {
                let err = OrchestratorError::from(e);
                self.fail_task(id, &err);
                return Err(err);
            }
        }

        tracing::info!(task_id = %id, applied = selected.len(), "changes applied");
        self.publish_status(id, TaskStatus::Done);
        Ok(true)
    }

    fn check_applicable(&self, changes: &[&ProposedChange]) -> Result<(), OrchestratorError> {
        self.inner.workspace.require_current()?;
        if let Some(bad) = changes.iter().find(|c| normalize_path(&c.path).is_none()) {
            return Err(WorkspaceError::InvalidPath { path: bad.path.clone() }.into());
        }
        Ok(())
    }

    /// Discard the staged changes of a `pending_approval` or `error` task and
    /// mark it `done`. Returns `Ok(false)` in any other state.
    pub fn reject_changes(&self, id: &str) -> Result<bool, OrchestratorError> {
        let Some(task) = self.claim_for_finish(id, &[TaskStatus::PendingApproval, TaskStatus::Error])? else {
            return Ok(false);
        };

        self.update_task(id, |t| t.proposed.clear());
        if task.is_pending()
            && let Some(item_id) = &task.memory_item_id
        {
            self.inner.memory.update(
                item_id,
                MemoryPatch {
                    outcome: Some(Outcome::Cancelled),
                    files_modified: Some(Vec::new()),
                    ..Default::default()
                },
            );
        }

        tracing::info!(task_id = %id, "changes rejected");
        self.publish_status(id, TaskStatus::Done);
        Ok(true)
    }

    /// Move task `id` to `done` if it is in one of `from`. Returns the task as
    /// it was before the move, or `None` if the state did not allow it.
    fn claim_for_finish(&self, id: &str, from: &[TaskStatus]) -> Result<Option<Task>, OrchestratorError> {
        let mut tasks = self.lock();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::TaskNotFound { id: id.to_string() })?;
        if !from.contains(&task.status) {
            tracing::debug!(task_id = %id, status = %task.status, "finish ignored");
            return Ok(None);
        }
        let before = task.clone();
        task.status = TaskStatus::Done;
        task.updated_at = Utc::now();
        Ok(Some(before))
    }

    // ── Task bookkeeping ─────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Task>> {
        self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new task and move it to `running`.
    fn begin(&self, goal: &str, focus: Vec<String>, mode: TaskMode) -> String {
        let task = Task::new(goal, focus, mode);
        let id = task.id.clone();
        self.lock().insert(id.clone(), task);
        tracing::info!(task_id = %id, %mode, goal, "task created");
        self.inner.bus.publish(Event::TaskCreated {
            task_id: id.clone(),
            goal: goal.to_string(),
            mode,
        });
        self.set_status(&id, TaskStatus::Running);
        id
    }

    /// Close out a task flow: `pending_approval` on success, `error` otherwise.
    fn finish(&self, id: &str, result: Result<(), OrchestratorError>) -> Result<Task, OrchestratorError> {
        match result {
            Ok(()) => self.set_status(id, TaskStatus::PendingApproval),
            Err(e) => self.fail_task(id, &e),
        }
        self.task(id)
            .ok_or_else(|| OrchestratorError::TaskNotFound { id: id.to_string() })
    }

    fn update_task(&self, id: &str, f: impl FnOnce(&mut Task)) -> Option<Task> {
        let mut tasks = self.lock();
        let task = tasks.get_mut(id)?;
        f(task);
        task.updated_at = Utc::now();
        Some(task.clone())
    }

    fn set_status(&self, id: &str, status: TaskStatus) {
        if self.update_task(id, |t| t.status = status).is_some() {
            self.publish_status(id, status);
        }
    }

    fn publish_status(&self, id: &str, status: TaskStatus) {
        tracing::debug!(task_id = %id, %status, "task status");
        self.inner.bus.publish(Event::TaskUpdated {
            task_id: id.to_string(),
            status,
        });
    }

    fn add_tokens(&self, id: &str, tokens: u64) {
        self.update_task(id, |t| t.tokens_used += tokens);
    }

    fn notify(&self, id: &str, level: NotificationLevel, message: String) {
        self.inner.bus.publish(Event::Notification {
            level,
            message,
            task_id: Some(id.to_string()),
        });
    }

    /// Move a task to `error`, announce it and log it to memory.
    fn fail_task(&self, id: &str, err: &OrchestratorError) {
        tracing::error!(task_id = %id, error = %err, "task failed");
        let Some(task) = self.update_task(id, |t| {
            t.status = TaskStatus::Error;
            t.error = Some(err.to_string());
        }) else {
            return;
        };
        self.publish_status(id, TaskStatus::Error);
        self.notify(id, NotificationLevel::Error, format!("Task failed: {}", err));
        if task.memory_item_id.is_none() {
            self.remember(&task, Outcome::Fail, err.to_string());
        }
    }

    /// Record the task in memory and link the item back to it.
    fn remember(&self, task: &Task, outcome: Outcome, summary: String) {
        let item = self.inner.memory.add(NewMemoryItem {
            goal: task.goal.clone(),
            focus_paths: task.focus_paths.clone(),
            outcome: Some(outcome),
            summary,
            extra_tags: vec![task.mode.to_string()],
            duration_ms: (Utc::now() - task.created_at).num_milliseconds().max(0) as u64,
            iterations: task.iterations.len() as u32,
            tokens_used: task.tokens_used,
            files_modified: task.proposed_paths(),
            ..Default::default()
        });
        self.update_task(&task.id, |t| t.memory_item_id = Some(item.id));
    }

    /// Announce edits dropped for falling outside the focus set.
    fn report_dropped(&self, id: &str, role: AgentRole, dropped: &[String]) {
        if dropped.is_empty() {
            return;
        }
        tracing::warn!(task_id = %id, %role, ?dropped, "dropped edits outside focus");
        self.notify(
            id,
            NotificationLevel::Warning,
            format!("Ignored {} edits outside the focus set: {}", role, dropped.join(", ")),
        );
    }
}

// ── Helpers shared by the task flows ─────────────────────────────────

/// Normalize and deduplicate caller-supplied focus paths, keeping order.
fn normalize_focus(paths: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for raw in paths {
        match normalize_path(raw) {
            Some(path) => {
                if seen.insert(path.clone()) {
                    out.push(path);
                }
            }
            None => tracing::warn!(path = %raw, "ignoring invalid focus path"),
        }
    }
    out
}

/// Planner selection: existing files only, deduplicated, capped.
fn select_focus(snapshot: &WorkspaceSnapshot, requested: &[String], max: usize) -> Vec<String> {
    normalize_focus(requested)
        .into_iter()
        .filter(|p| snapshot.files.contains_key(p))
        .take(max)
        .collect()
}

/// Keep edits whose path is in `focus`, last edit per path winning. Returns
/// the kept edits and the dropped paths.
fn filter_to_focus(edits: Vec<FileEdit>, focus: &[String]) -> (Vec<FileEdit>, Vec<String>) {
    let mut kept: Vec<FileEdit> = Vec::new();
    let mut dropped = Vec::new();
    for mut edit in edits {
        match normalize_path(&edit.path).filter(|p| focus.contains(p)) {
            Some(path) => {
                edit.path = path;
                kept.retain(|k| k.path != edit.path);
                kept.push(edit);
            }
            None => dropped.push(edit.path),
        }
    }
    (kept, dropped)
}

fn focus_files<'a>(files: &'a BTreeMap<String, WorkspaceFile>, focus: &[String]) -> Vec<&'a WorkspaceFile> {
    focus.iter().filter_map(|p| files.get(p)).collect()
}

/// Files the focus set depends on, excluding the focus set itself.
fn context_files<'a>(
    files: &'a BTreeMap<String, WorkspaceFile>,
    graph: &DependencyGraph,
    focus: &[String],
) -> Vec<&'a WorkspaceFile> {
    graph
        .closure(focus)
        .iter()
        .filter(|p| !focus.contains(p))
        .filter_map(|p| files.get(p))
        .take(MAX_CONTEXT_FILES)
        .collect()
}

fn edit_language(edit: &FileEdit, existing: Option<&WorkspaceFile>) -> String {
    if !edit.language.is_empty() {
        return edit.language.clone();
    }
    existing
        .map(|f| f.language.clone())
        .unwrap_or_else(|| language_for_path(&edit.path).to_string())
}

/// Staged changes for `edits` against `base`. Edits that leave a file
/// unchanged are skipped.
fn diff_edits(base: &BTreeMap<String, WorkspaceFile>, edits: &[FileEdit]) -> Vec<ProposedChange> {
    edits
        .iter()
        .filter_map(|edit| {
            let existing = base.get(&edit.path);
            if existing.is_some_and(|f| f.content == edit.new_content) {
                return None;
            }
            Some(ProposedChange {
                path: edit.path.clone(),
                language: edit_language(edit, existing),
                old_content: existing.map(|f| f.content.clone()),
                new_content: edit.new_content.clone(),
            })
        })
        .collect()
}
