//! Single-pass edit flow: coder, focus filter, reviewer, focus filter.

use crate::agents::{self, AgentRole, CoderReply, ReviewerReply, prompts};
use crate::errors::OrchestratorError;
use crate::memory::Outcome;
use crate::workspace::DependencyGraph;

use super::{
    Orchestrator, Task, TaskMode, context_files, diff_edits, filter_to_focus, focus_files, normalize_focus,
};

impl Orchestrator {
    /// Propose changes for `goal` limited to `focus_paths`.
    ///
    /// The returned task is `pending_approval` with its proposals staged, or
    /// `error` when an agent call, a reply or the workspace failed.
    pub async fn run_edit_task(&self, goal: &str, focus_paths: &[String]) -> Result<Task, OrchestratorError> {
        let focus = normalize_focus(focus_paths);
        let id = self.begin(goal, focus.clone(), TaskMode::Edit);
        let result = self.edit_stages(&id, goal, &focus).await;
        self.finish(&id, result)
    }

    async fn edit_stages(&self, id: &str, goal: &str, focus: &[String]) -> Result<(), OrchestratorError> {
        if focus.is_empty() {
            return Err(OrchestratorError::EmptyFocus { id: id.to_string() });
        }
        let snapshot = self.inner.workspace.require_current()?;
        self.update_task(id, |t| t.workspace_id = Some(snapshot.id.clone()));

        let settings = &self.inner.settings;
        let llm = self.inner.llm.as_ref();
        let graph = DependencyGraph::build(&snapshot);
        let memory = self.inner.memory.context_for(goal, settings.memory_context);
        let originals = focus_files(&snapshot.files, focus);
        let context = context_files(&snapshot.files, &graph, focus);

        let messages = prompts::coder_messages(goal, &originals, &context, &memory);
        let coder = agents::ask::<CoderReply>(llm, AgentRole::Coder, &messages, &settings.call_options).await?;
        self.add_tokens(id, coder.tokens);
        let notes = coder.reply.notes;
        let (mut edits, mut dropped) = filter_to_focus(coder.reply.edits, focus);
        self.report_dropped(id, AgentRole::Coder, &dropped);
        tracing::info!(task_id = %id, edits = edits.len(), dropped = dropped.len(), "coder finished");

        let mut review_notes = String::new();
        if !edits.is_empty() {
            let messages = prompts::reviewer_messages(goal, &originals, &edits, &notes);
            let review =
                agents::ask::<ReviewerReply>(llm, AgentRole::Reviewer, &messages, &settings.call_options).await?;
            self.add_tokens(id, review.tokens);
            review_notes = review.reply.notes;
            if let Some(revised) = review.reply.edits {
                let (kept, rejected) = filter_to_focus(revised, focus);
                self.report_dropped(id, AgentRole::Reviewer, &rejected);
                dropped.extend(rejected);
                edits = kept;
            }
            tracing::info!(task_id = %id, edits = edits.len(), "reviewer finished");
        }

        let proposed = diff_edits(&snapshot.files, &edits);
        let notes = compose_notes(notes, proposed.len(), &dropped);
        let outcome = if proposed.is_empty() { Outcome::Partial } else { Outcome::Success };

        let Some(task) = self.update_task(id, |t| {
            t.notes = notes.clone();
            t.review_notes = review_notes;
            t.proposed = proposed;
        }) else {
            return Err(OrchestratorError::TaskNotFound { id: id.to_string() });
        };
        self.remember(&task, outcome, notes);
        Ok(())
    }
}

fn compose_notes(coder_notes: String, proposed: usize, dropped: &[String]) -> String {
    let mut notes = coder_notes.trim().to_string();
    if !dropped.is_empty() {
        if !notes.is_empty() {
            notes.push('\n');
        }
        notes.push_str(&format!("Ignored edits outside the focus set: {}", dropped.join(", ")));
    }
    if proposed == 0 {
        if !notes.is_empty() {
            notes.push('\n');
        }
        notes.push_str("No changes proposed.");
    }
    notes
}
