//! Drives one execution context to a single terminal outcome.

use std::time::Duration;

use tokio::sync::oneshot;

use super::backend::LaunchedContext;
use super::types::{ContextMessage, RunResult};

/// Collects context output until the first terminal message.
///
/// Anything pushed after the run has finished, including a duplicate `exit`,
/// is ignored, so a run resolves exactly once.
#[derive(Debug)]
pub struct RunAccumulator {
    run_id: String,
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
    error: Option<String>,
    finished: bool,
}

impl RunAccumulator {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            error: None,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Apply `msg`. Returns false when it was ignored.
    pub fn push(&mut self, msg: ContextMessage) -> bool {
        if self.finished || msg.run_id() != self.run_id {
            return false;
        }
        match msg {
            ContextMessage::Stdout { text, .. } => self.stdout.push_str(&text),
            ContextMessage::Stderr { text, .. } => self.stderr.push_str(&text),
            ContextMessage::Exit { code, .. } => {
                self.exit_code = Some(code);
                self.finished = true;
            }
            ContextMessage::Error { error, .. } => {
                self.error = Some(error);
                self.finished = true;
            }
        }
        true
    }

    /// Resolve the run with a synthesized error unless it already finished.
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if self.finished {
            return false;
        }
        self.error = Some(error.into());
        self.finished = true;
        true
    }

    pub fn into_result(self) -> RunResult {
        RunResult {
            run_id: self.run_id,
            stdout: self.stdout,
            stderr: self.stderr,
            exit_code: self.exit_code,
            error: self.error,
        }
    }
}

/// Pump `ctx` until a terminal message, the `timeout`, or a stop request.
///
/// `observe` sees every accepted message, plus a synthesized `Error` when the
/// driver resolves the run itself. The context is always terminated before
/// returning.
pub(crate) async fn drive<F>(
    run_id: &str,
    mut ctx: LaunchedContext,
    timeout: Duration,
    mut stop: oneshot::Receiver<()>,
    mut observe: F,
) -> RunResult
where
    F: FnMut(&ContextMessage),
{
    let mut acc = RunAccumulator::new(run_id);
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut stop_open = true;

    loop {
        let msg = tokio::select! {
            msg = ctx.messages.recv() => match msg {
                Some(msg) => msg,
                None => synthesized(run_id, "Execution context closed without a result".to_string()),
            },
            _ = &mut deadline => {
                tracing::debug!(%run_id, timeout_ms = timeout.as_millis() as u64, "run timed out");
                synthesized(run_id, format!("Timeout after {}ms", timeout.as_millis()))
            }
            res = &mut stop, if stop_open => match res {
                Ok(()) => synthesized(run_id, "Run stopped".to_string()),
                Err(_) => {
                    stop_open = false;
                    continue;
                }
            },
        };

        if msg.run_id() != run_id {
            continue;
        }
        observe(&msg);
        acc.push(msg);
        if acc.is_finished() {
            break;
        }
    }

    ctx.control.terminate().await;
    acc.into_result()
}

fn synthesized(run_id: &str, error: String) -> ContextMessage {
    ContextMessage::Error {
        run_id: run_id.to_string(),
        error,
    }
}
