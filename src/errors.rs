//! Typed error hierarchy for codeloop.
//!
//! One enum per subsystem:
//! - `BusError` for event bus waits
//! - `WorkspaceError` for snapshot and file mutations
//! - `RunnerError` for bundling and launching sandboxed runs
//! - `AgentError` for LLM calls and reply protocol violations
//! - `OrchestratorError` for task lifecycle failures

use thiserror::Error;

/// Errors from the event bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Timed out after {timeout_ms}ms waiting for {kind}")]
    Timeout { kind: String, timeout_ms: u64 },

    #[error("Event bus was dropped while waiting for {kind}")]
    Closed { kind: String },
}

/// Errors from the workspace model.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("No workspace is currently loaded")]
    NoCurrent,

    #[error("Workspace {id} not found")]
    NotFound { id: String },

    #[error("Template '{id}' not found")]
    TemplateNotFound { id: String },

    #[error("File {path} not found in workspace")]
    FileNotFound { path: String },

    #[error("File {path} already exists in workspace")]
    PathExists { path: String },

    #[error("Invalid file path '{path}'")]
    InvalidPath { path: String },

    #[error("Workspace store error: {0}")]
    Store(#[source] anyhow::Error),
}

/// Errors from the sandboxed runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("No workspace is loaded; nothing to run")]
    NoWorkspace,

    #[error("Entry file {path} not found in project")]
    EntryNotFound { path: String },

    #[error("No interpreter configured for language '{language}'")]
    NoInterpreter { language: String },

    #[error("Failed to launch execution context: {0}")]
    Launch(#[source] std::io::Error),

    #[error("Failed to prepare sandbox directory: {0}")]
    Sandbox(#[source] std::io::Error),
}

/// Errors from agent invocations.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("{role} agent call failed: {source}")]
    Llm {
        role: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{role} agent returned a malformed reply: {message}")]
    Protocol { role: String, message: String },
}

/// Errors from the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Task {id} not found")]
    TaskNotFound { id: String },

    #[error("Task {id} has no focus paths")]
    EmptyFocus { id: String },

    #[error("Workspace has no entry file to run")]
    NoEntry,

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_timeout_carries_kind_and_deadline() {
        let err = BusError::Timeout {
            kind: "runner:exit".into(),
            timeout_ms: 250,
        };
        let msg = err.to_string();
        assert!(msg.contains("runner:exit"));
        assert!(msg.contains("250ms"));
    }

    #[test]
    fn workspace_file_not_found_is_matchable() {
        let err = WorkspaceError::FileNotFound {
            path: "main.js".into(),
        };
        match &err {
            WorkspaceError::FileNotFound { path } => assert_eq!(path, "main.js"),
            _ => panic!("Expected FileNotFound"),
        }
    }

    #[test]
    fn agent_protocol_error_names_role() {
        let err = AgentError::Protocol {
            role: "coder".into(),
            message: "missing edits".into(),
        };
        assert!(err.to_string().starts_with("coder agent"));
    }

    #[test]
    fn orchestrator_error_converts_from_agent_error() {
        let inner = AgentError::Protocol {
            role: "planner".into(),
            message: "not json".into(),
        };
        let err: OrchestratorError = inner.into();
        match &err {
            OrchestratorError::Agent(AgentError::Protocol { role, .. }) => {
                assert_eq!(role, "planner");
            }
            _ => panic!("Expected OrchestratorError::Agent(Protocol)"),
        }
    }

    #[test]
    fn orchestrator_error_converts_from_workspace_error() {
        let err: OrchestratorError = WorkspaceError::NoCurrent.into();
        assert!(matches!(
            err,
            OrchestratorError::Workspace(WorkspaceError::NoCurrent)
        ));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&BusError::Closed { kind: "x".into() });
        assert_std_error(&WorkspaceError::NoCurrent);
        assert_std_error(&RunnerError::EntryNotFound { path: "a".into() });
        assert_std_error(&OrchestratorError::TaskNotFound { id: "t".into() });
    }
}
