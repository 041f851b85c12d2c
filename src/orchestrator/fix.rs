//! Auto-fix loop: fix coder, reviewer, run, critic, on a private working copy.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::agents::{self, AgentRole, CoderReply, FileEdit, FixPrompt, ReviewerReply, RunFeedback, SummarizerReply, prompts};
use crate::bus::{Event, NotificationLevel};
use crate::errors::OrchestratorError;
use crate::memory::Outcome;
use crate::workspace::{DependencyGraph, WorkspaceFile};

use super::critic::{self, Critic};
use super::{
    FixIteration, FixOptions, IterationRun, Orchestrator, ProposedChange, StopReason, Task, TaskMode,
    context_files, edit_language, filter_to_focus, focus_files, normalize_focus,
};

impl Orchestrator {
    /// Iterate towards a program that reaches `goal` and runs cleanly.
    ///
    /// Edits land in a private copy of the current snapshot. A baseline run
    /// precedes the first pass so the fix coder sees the current failure. The
    /// loop ends on a clean run, on an empty edit set (critic rule A), on a
    /// repeated normalized error (critic rule B) or when `max_iters` passes
    /// are used. Whatever differs from the snapshot inside the focus set is
    /// staged for approval.
    pub async fn run_auto_fix(
        &self,
        goal: &str,
        focus_paths: &[String],
        options: FixOptions,
    ) -> Result<Task, OrchestratorError> {
        let focus = normalize_focus(focus_paths);
        let id = self.begin(goal, focus.clone(), TaskMode::AutoFix);
        let result = self.fix_stages(&id, goal, &focus, options).await;
        self.finish(&id, result)
    }

    async fn fix_stages(
        &self,
        id: &str,
        goal: &str,
        focus: &[String],
        options: FixOptions,
    ) -> Result<(), OrchestratorError> {
        if focus.is_empty() {
            return Err(OrchestratorError::EmptyFocus { id: id.to_string() });
        }
        let snapshot = self.inner.workspace.require_current()?;
        let entry = snapshot
            .entry_path()
            .map(str::to_string)
            .ok_or(OrchestratorError::NoEntry)?;
        self.update_task(id, |t| t.workspace_id = Some(snapshot.id.clone()));

        let settings = &self.inner.settings;
        let llm = self.inner.llm.as_ref();
        let max_iters = options.max_iters.max(1);
        let graph = DependencyGraph::build(&snapshot);
        let memory = self.inner.memory.context_for(goal, settings.memory_context);
        let mut working = snapshot.files.clone();

        let baseline = self.check_run(&working, &entry, options.test_also).await;
        tracing::info!(task_id = %id, failing = baseline.is_error(), "baseline run finished");
        self.update_task(id, |t| t.baseline = Some(baseline.clone()));

        let mut critic = Critic::new(settings.repeat_error_threshold);
        let mut previous = baseline;
        let mut earlier_notes: Vec<String> = Vec::new();
        let mut review_notes = String::new();
        let mut stop = StopReason::MaxIterations;

        for i in 1..=max_iters {
            let messages = {
                let files = focus_files(&working, focus);
                let context = context_files(&working, &graph, focus);
                prompts::fix_coder_messages(&FixPrompt {
                    goal,
                    iteration: i,
                    max_iters,
                    files: &files,
                    context: &context,
                    previous: Some(feedback(&previous)),
                    earlier_notes: &earlier_notes,
                    memory: &memory,
                })
            };
            let coder = agents::ask::<CoderReply>(llm, AgentRole::FixCoder, &messages, &settings.call_options).await?;
            self.add_tokens(id, coder.tokens);
            let coder_notes = coder.reply.notes;
            let (edits, dropped) = filter_to_focus(coder.reply.edits, focus);
            self.report_dropped(id, AgentRole::FixCoder, &dropped);

            if let Some(reason) = critic::check_edits(edits.len(), &previous) {
                tracing::info!(task_id = %id, iteration = i, ?reason, "fix coder proposed no edits");
                earlier_notes.push(coder_notes);
                stop = reason;
                break;
            }

            let messages = {
                let originals = focus_files(&working, focus);
                prompts::reviewer_messages(goal, &originals, &edits, &coder_notes)
            };
            let review =
                agents::ask::<ReviewerReply>(llm, AgentRole::Reviewer, &messages, &settings.call_options).await?;
            self.add_tokens(id, review.tokens);
            let edits = match review.reply.edits {
                Some(revised) => {
                    let (kept, rejected) = filter_to_focus(revised, focus);
                    self.report_dropped(id, AgentRole::Reviewer, &rejected);
                    kept
                }
                None => edits,
            };
            review_notes = review.reply.notes;

            let changed = merge(&mut working, &edits);
            let run = self.check_run(&working, &entry, options.test_also).await;
            tracing::info!(
                task_id = %id,
                iteration = i,
                changed = changed.len(),
                failing = run.is_error(),
                "fix iteration finished"
            );

            self.update_task(id, |t| {
                t.iterations.push(FixIteration {
                    i,
                    coder_notes: coder_notes.clone(),
                    reviewer_notes: review_notes.clone(),
                    run: run.clone(),
                    changed,
                })
            });
            self.inner.bus.publish(Event::TaskIteration {
                task_id: id.to_string(),
                iteration: i,
                error: run.headline(),
            });
            earlier_notes.push(coder_notes);

            let verdict = critic.observe(&run);
            previous = run;
            if let Some(reason) = verdict {
                stop = reason;
                break;
            }
        }

        let proposed = diff_working(&snapshot.files, &working, focus);
        let Some(task) = self.update_task(id, |t| {
            t.proposed = proposed;
            t.stop_reason = Some(stop.clone());
            t.review_notes = review_notes;
        }) else {
            return Err(OrchestratorError::TaskNotFound { id: id.to_string() });
        };

        let note = outcome_note(&stop, task.iterations.len(), previous.headline().as_deref());
        if !stop.converged() {
            self.notify(id, NotificationLevel::Warning, note.clone());
        }
        let (summary, outcome) = self.summarize(&task, &note, previous.headline().as_deref()).await;

        let Some(task) = self.update_task(id, |t| t.notes = note) else {
            return Err(OrchestratorError::TaskNotFound { id: id.to_string() });
        };
        self.remember(&task, outcome, summary);
        Ok(())
    }

    /// Run the entry file, then the discovered tests when asked and the
    /// entry ran cleanly. A failing test counts as a runtime error.
    async fn check_run(&self, files: &BTreeMap<String, WorkspaceFile>, entry: &str, test_also: bool) -> IterationRun {
        let runner = &self.inner.runner;
        let timeout = self.inner.settings.fix_timeout;
        let contents: BTreeMap<String, String> = files.iter().map(|(p, f)| (p.clone(), f.content.clone())).collect();

        let result = runner.run_project_and_capture(&contents, entry, timeout).await;
        if result.is_error() || !test_also {
            return IterationRun::from_result(&result);
        }

        for test in runner.run_tests(&contents, timeout).await {
            if test.result.is_error() {
                tracing::debug!(path = %test.path, "test failed");
                let mut combined = test.result;
                combined.stdout = format!("{}{}", result.stdout, combined.stdout);
                combined.stderr = format!("[test {}]\n{}", test.path, combined.stderr);
                return IterationRun::from_result(&combined);
            }
        }
        IterationRun::from_result(&result)
    }

    /// Ask the summarizer for a memory entry, falling back to `note` and an
    /// outcome derived from the stop reason when its reply is unusable.
    async fn summarize(&self, task: &Task, note: &str, last_error: Option<&str>) -> (String, Outcome) {
        let fallback_outcome = match task.stop_reason {
            Some(ref reason) if reason.converged() => Outcome::Success,
            _ if !task.proposed.is_empty() => Outcome::Partial,
            _ => Outcome::Fail,
        };

        let messages = prompts::summarizer_messages(
            &task.goal,
            note,
            task.iterations.len() as u32,
            last_error,
            &task.proposed_paths(),
        );
        match agents::ask::<SummarizerReply>(
            self.inner.llm.as_ref(),
            AgentRole::Summarizer,
            &messages,
            &self.inner.settings.call_options,
        )
        .await
        {
            Ok(call) if !call.reply.summary.trim().is_empty() => {
                self.add_tokens(&task.id, call.tokens);
                (call.reply.summary, call.reply.outcome)
            }
            Ok(call) => {
                self.add_tokens(&task.id, call.tokens);
                (note.to_string(), fallback_outcome)
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "summarizer failed; using fallback summary");
                (note.to_string(), fallback_outcome)
            }
        }
    }
}

fn feedback(run: &IterationRun) -> RunFeedback<'_> {
    RunFeedback {
        stdout: &run.stdout,
        stderr: &run.stderr,
        error: run.error.as_deref(),
        parsed: run.parsed_error.as_ref(),
    }
}

/// Write `edits` into the working copy. Returns the paths whose content
/// actually changed.
fn merge(working: &mut BTreeMap<String, WorkspaceFile>, edits: &[FileEdit]) -> Vec<String> {
    let now = Utc::now();
    let mut changed = Vec::new();
    for edit in edits {
        let language = edit_language(edit, working.get(&edit.path));
        match working.get_mut(&edit.path) {
            Some(file) if file.content == edit.new_content => {}
            Some(file) => {
                file.content = edit.new_content.clone();
                file.language = language;
                file.updated_at = now;
                changed.push(edit.path.clone());
            }
            None => {
                working.insert(
                    edit.path.clone(),
                    WorkspaceFile::new(edit.path.clone(), language, edit.new_content.clone()),
                );
                changed.push(edit.path.clone());
            }
        }
    }
    changed
}

/// Focus files whose working content differs from the snapshot.
fn diff_working(
    base: &BTreeMap<String, WorkspaceFile>,
    working: &BTreeMap<String, WorkspaceFile>,
    focus: &[String],
) -> Vec<ProposedChange> {
    focus
        .iter()
        .filter_map(|path| {
            let new = working.get(path)?;
            let old = base.get(path);
            if old.is_some_and(|f| f.content == new.content) {
                return None;
            }
            Some(ProposedChange {
                path: path.clone(),
                language: new.language.clone(),
                old_content: old.map(|f| f.content.clone()),
                new_content: new.content.clone(),
            })
        })
        .collect()
}

fn outcome_note(stop: &StopReason, iterations: usize, last_error: Option<&str>) -> String {
    let last_error = last_error.unwrap_or("unknown error");
    match stop {
        StopReason::Clean => format!("Program runs cleanly after {} iteration(s).", iterations),
        StopReason::NothingToDo => "Program already runs cleanly; no further changes proposed.".to_string(),
        StopReason::NoEdits => format!(
            "Stopped after {} iteration(s): the fix coder proposed no edits while the program still fails ({}).",
            iterations, last_error
        ),
        StopReason::RepeatedError { signature } => format!(
            "Stopped after {} iteration(s): the same error keeps coming back ({}).",
            iterations, signature
        ),
        StopReason::MaxIterations => format!(
            "Gave up after {} iteration(s); the program still fails ({}).",
            iterations, last_error
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, content: &str) -> WorkspaceFile {
        WorkspaceFile::new(path, "javascript", content)
    }

    fn edit(path: &str, content: &str) -> FileEdit {
        FileEdit {
            path: path.into(),
            language: String::new(),
            new_content: content.into(),
        }
    }

    #[test]
    fn merge_reports_only_real_changes() {
        let mut working = BTreeMap::from([("main.js".to_string(), file("main.js", "a"))]);
        let changed = merge(&mut working, &[edit("main.js", "a"), edit("new.py", "print(1)")]);
        assert_eq!(changed, vec!["new.py"]);
        assert_eq!(working["new.py"].language, "python");

        let changed = merge(&mut working, &[edit("main.js", "b")]);
        assert_eq!(changed, vec!["main.js"]);
        assert_eq!(working["main.js"].content, "b");
        assert_eq!(working["main.js"].language, "javascript");
    }

    #[test]
    fn diff_working_limits_to_focus() {
        let base = BTreeMap::from([
            ("main.js".to_string(), file("main.js", "old")),
            ("util.js".to_string(), file("util.js", "u")),
        ]);
        let mut working = base.clone();
        working.get_mut("main.js").unwrap().content = "new".into();
        working.get_mut("util.js").unwrap().content = "changed".into();

        let proposed = diff_working(&base, &working, &["main.js".to_string()]);
        assert_eq!(proposed.len(), 1);
        assert_eq!(proposed[0].old_content.as_deref(), Some("old"));
        assert_eq!(proposed[0].new_content, "new");
    }

    #[test]
    fn outcome_note_explains_repeats() {
        let note = outcome_note(
            &StopReason::RepeatedError {
                signature: "TypeError: x is undefined".into(),
            },
            2,
            None,
        );
        assert!(note.contains("2 iteration(s)"));
        assert!(note.contains("TypeError: x is undefined"));
    }
}
