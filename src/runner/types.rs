use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Which pipe a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Message emitted by an execution context.
///
/// A context emits any number of `Stdout`/`Stderr` chunks followed by exactly
/// one terminal `Exit` or `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContextMessage {
    Stdout {
        #[serde(rename = "runId")]
        run_id: String,
        text: String,
    },
    Stderr {
        #[serde(rename = "runId")]
        run_id: String,
        text: String,
    },
    Exit {
        #[serde(rename = "runId")]
        run_id: String,
        code: i32,
    },
    Error {
        #[serde(rename = "runId")]
        run_id: String,
        error: String,
    },
}

impl ContextMessage {
    pub fn run_id(&self) -> &str {
        match self {
            ContextMessage::Stdout { run_id, .. }
            | ContextMessage::Stderr { run_id, .. }
            | ContextMessage::Exit { run_id, .. }
            | ContextMessage::Error { run_id, .. } => run_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ContextMessage::Exit { .. } | ContextMessage::Error { .. })
    }
}

/// A self-contained program ready to hand to a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub run_id: String,
    pub language: String,
    pub code: String,
    /// Files placed next to the program for languages that resolve imports
    /// from disk. Empty for bundled JavaScript.
    pub support_files: BTreeMap<String, String>,
}

/// Final outcome of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub run_id: String,
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunResult {
    pub fn failed(run_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// True when the run reported an error or exited non-zero.
    pub fn is_error(&self) -> bool {
        self.error.is_some() || self.exit_code.is_some_and(|code| code != 0)
    }
}
