//! Prompt templates for each agent role.
//!
//! Every builder returns a system message fixing the reply shape and a user
//! message carrying the task context.

use crate::llm::ChatMessage;
use crate::memory::TaskMemoryItem;
use crate::runner::ParsedError;
use crate::util::truncate_chars;
use crate::workspace::{DependencyGraph, WorkspaceFile, WorkspaceSnapshot};

use super::replies::FileEdit;

/// Per-file cap on content shown to a model.
const MAX_FILE_CHARS: usize = 12_000;
/// Cap on each captured output stream shown to the fix coder.
const MAX_OUTPUT_CHARS: usize = 4_000;

const EDIT_SHAPE: &str = r#"Respond with ONLY a JSON object in this exact format:

```json
{
  "notes": "What you changed and why, in one or two sentences",
  "edits": [
    { "path": "relative/path.js", "language": "javascript", "newContent": "full new file content" }
  ]
}
```

Each edit replaces the whole file. Only edit files listed under "Editable Files"."#;

/// Output of the previous run, as fed back to the fix coder.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunFeedback<'a> {
    pub stdout: &'a str,
    pub stderr: &'a str,
    pub error: Option<&'a str>,
    pub parsed: Option<&'a ParsedError>,
}

impl RunFeedback<'_> {
    fn render(&self) -> String {
        let mut out = String::new();
        if let Some(parsed) = self.parsed {
            out.push_str(&format!("**Error:** {}\n", parsed.headline()));
            if let (Some(file), Some(line)) = (&parsed.file, parsed.line) {
                out.push_str(&format!("**Location:** {}:{}\n", file, line));
            }
        } else if let Some(error) = self.error {
            out.push_str(&format!("**Error:** {}\n", error));
        } else {
            out.push_str("The program ran without errors.\n");
        }
        if !self.stdout.trim().is_empty() {
            out.push_str(&format!(
                "\n### stdout\n```\n{}\n```\n",
                truncate_chars(self.stdout.trim_end(), MAX_OUTPUT_CHARS)
            ));
        }
        if !self.stderr.trim().is_empty() {
            out.push_str(&format!(
                "\n### stderr\n```\n{}\n```\n",
                truncate_chars(self.stderr.trim_end(), MAX_OUTPUT_CHARS)
            ));
        }
        out
    }
}

fn render_files(files: &[&WorkspaceFile]) -> String {
    if files.is_empty() {
        return "(none)\n".to_string();
    }
    files
        .iter()
        .map(|f| {
            format!(
                "### {} ({})\n```{}\n{}\n```\n",
                f.path,
                f.language,
                f.language,
                truncate_chars(&f.content, MAX_FILE_CHARS)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_edits(edits: &[FileEdit]) -> String {
    if edits.is_empty() {
        return "(no edits proposed)\n".to_string();
    }
    edits
        .iter()
        .map(|e| {
            format!(
                "### {}\n```{}\n{}\n```\n",
                e.path,
                e.language,
                truncate_chars(&e.new_content, MAX_FILE_CHARS)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_memory(items: &[TaskMemoryItem]) -> String {
    if items.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = items
        .iter()
        .map(|m| {
            let summary = if m.summary.is_empty() { "no summary" } else { m.summary.as_str() };
            format!("- [{}] {}: {}", m.outcome, m.goal, truncate_chars(summary, 200))
        })
        .collect();
    format!("\n## Related Past Tasks\n{}\n", lines.join("\n"))
}

pub fn planner_messages(
    goal: &str,
    snapshot: &WorkspaceSnapshot,
    graph: &DependencyGraph,
    memory: &[TaskMemoryItem],
    max_files: usize,
) -> Vec<ChatMessage> {
    let system = format!(
        r#"You are the planner of a code-editing assistant. Pick the files that must change to reach the goal.

Respond with ONLY a JSON object in this exact format:

```json
{{
  "notes": "Short explanation of the selection",
  "focusPaths": ["path/one.js"]
}}
```

Select between 1 and {max_files} paths, all taken from the file list."#
    );

    let entry = snapshot.entry_path().unwrap_or("(none)");
    let files: Vec<String> = snapshot
        .files
        .values()
        .map(|f| format!("- {} ({}, {} bytes)", f.path, f.language, f.content.len()))
        .collect();

    let user = format!(
        "## Goal\n{goal}\n\n## Entry File\n{entry}\n\n## Files\n{files}\n\n## Dependencies\n```\n{graph}\n```\n{memory}",
        files = files.join("\n"),
        graph = graph.render(),
        memory = render_memory(memory),
    );

    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

pub fn coder_messages(
    goal: &str,
    focus: &[&WorkspaceFile],
    context: &[&WorkspaceFile],
    memory: &[TaskMemoryItem],
) -> Vec<ChatMessage> {
    let system = format!(
        "You are the coder of a code-editing assistant. Make the smallest change that reaches the goal.\n\n{}",
        EDIT_SHAPE
    );
    let user = format!(
        "## Goal\n{goal}\n\n## Editable Files\n{focus}\n## Read-only Context\n{context}{memory}",
        focus = render_files(focus),
        context = render_files(context),
        memory = render_memory(memory),
    );
    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

pub fn reviewer_messages(
    goal: &str,
    originals: &[&WorkspaceFile],
    edits: &[FileEdit],
    coder_notes: &str,
) -> Vec<ChatMessage> {
    let system = r#"You are the reviewer of a code-editing assistant. Check the proposed edits against the goal.

Respond with ONLY a JSON object in this exact format:

```json
{
  "notes": "Review findings",
  "edits": [
    { "path": "relative/path.js", "language": "javascript", "newContent": "full corrected file content" }
  ]
}
```

Omit "edits" to accept the proposal unchanged. Return a corrected list to replace it, or an empty list to reject every edit."#;

    let user = format!(
        "## Goal\n{goal}\n\n## Coder Notes\n{notes}\n\n## Original Files\n{originals}\n## Proposed Edits\n{edits}",
        notes = if coder_notes.is_empty() { "(none)" } else { coder_notes },
        originals = render_files(originals),
        edits = render_edits(edits),
    );
    vec![ChatMessage::system(system.to_string()), ChatMessage::user(user)]
}

/// Context for one auto-fix iteration.
#[derive(Debug, Clone, Copy)]
pub struct FixPrompt<'a> {
    pub goal: &'a str,
    pub iteration: u32,
    pub max_iters: u32,
    pub files: &'a [&'a WorkspaceFile],
    pub context: &'a [&'a WorkspaceFile],
    pub previous: Option<RunFeedback<'a>>,
    pub earlier_notes: &'a [String],
    pub memory: &'a [TaskMemoryItem],
}

pub fn fix_coder_messages(prompt: &FixPrompt<'_>) -> Vec<ChatMessage> {
    let system = format!(
        "You are the fix coder of a code-editing assistant. Make the program reach the goal and run without errors. \
         If the last run failed you must change something.\n\n{}",
        EDIT_SHAPE
    );

    let previous = prompt
        .previous
        .map(|p| p.render())
        .unwrap_or_else(|| "The program has not been run yet.\n".to_string());

    let earlier = if prompt.earlier_notes.is_empty() {
        String::new()
    } else {
        let lines: Vec<String> = prompt
            .earlier_notes
            .iter()
            .enumerate()
            .map(|(i, n)| format!("{}. {}", i + 1, n))
            .collect();
        format!("\n## Earlier Attempts\n{}\n", lines.join("\n"))
    };

    let user = format!(
        "## Goal\n{goal}\n\n## Iteration\n{i} of {max}\n\n## Last Run\n{previous}{earlier}\n## Editable Files\n{files}\n## Read-only Context\n{context}{memory}",
        goal = prompt.goal,
        i = prompt.iteration,
        max = prompt.max_iters,
        files = render_files(prompt.files),
        context = render_files(prompt.context),
        memory = render_memory(prompt.memory),
    );
    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

pub fn summarizer_messages(
    goal: &str,
    notes: &str,
    iterations: u32,
    last_error: Option<&str>,
    files_changed: &[String],
) -> Vec<ChatMessage> {
    let system = r#"You summarize finished code-editing tasks for a task log.

Respond with ONLY a JSON object in this exact format:

```json
{ "summary": "One or two sentences", "outcome": "success|fail|partial|cancelled" }
```"#;

    let changed = if files_changed.is_empty() {
        "(none)".to_string()
    } else {
        files_changed.join(", ")
    };
    let user = format!(
        "## Goal\n{goal}\n\n## Notes\n{notes}\n\n## Iterations\n{iterations}\n\n## Last Error\n{error}\n\n## Files Changed\n{changed}",
        error = last_error.unwrap_or("(none)"),
    );
    vec![ChatMessage::system(system.to_string()), ChatMessage::user(user)]
}
