//! Sandboxed execution of workspace programs.
//!
//! Two entry points:
//! - [`SandboxRunner::run`] runs the current workspace in the background and
//!   reports progress through `runner:*` bus events.
//! - [`SandboxRunner::run_project_and_capture`] runs an arbitrary file set and
//!   returns the collected [`RunResult`]; it publishes nothing.
//!
//! Both resolve each run exactly once and always tear the context down.
//! Failures (missing entry, launch errors, timeouts) come back inside the
//! result rather than being dropped.

pub mod backend;
pub mod bundle;
pub mod discover;
mod driver;
pub mod parse;
pub mod types;

pub use backend::{ContextControl, LaunchedContext, ProcessBackend, SandboxBackend, default_interpreters};
pub use discover::{default_test_patterns, find_test_files};
pub use driver::RunAccumulator;
pub use parse::{ParsedError, error_signature, normalize, parse_error};
pub use types::{ContextMessage, LaunchRequest, OutputStream, RunResult};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::bus::{Event, EventBus};
use crate::errors::RunnerError;
use crate::workspace::{WorkspaceModel, language_for_path};

/// Timeout used by [`SandboxRunner::run`].
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub default_timeout: Duration,
    pub test_patterns: Vec<String>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_RUN_TIMEOUT,
            test_patterns: default_test_patterns(),
        }
    }
}

/// Handle for a background run started with [`SandboxRunner::run`].
pub struct RunHandle {
    pub run_id: String,
    join: JoinHandle<RunResult>,
}

impl RunHandle {
    pub async fn wait(self) -> RunResult {
        match self.join.await {
            Ok(result) => result,
            Err(e) => RunResult::failed(self.run_id, format!("Run task failed: {}", e)),
        }
    }
}

/// Result of running one discovered test file.
#[derive(Debug, Clone, PartialEq)]
pub struct TestRun {
    pub path: String,
    pub result: RunResult,
}

#[derive(Clone)]
pub struct SandboxRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    backend: Arc<dyn SandboxBackend>,
    workspace: WorkspaceModel,
    bus: EventBus,
    settings: RunnerSettings,
    active: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl SandboxRunner {
    pub fn new(backend: Arc<dyn SandboxBackend>, workspace: WorkspaceModel, bus: EventBus, settings: RunnerSettings) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                backend,
                workspace,
                bus,
                settings,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.inner.settings
    }

    fn active(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<()>>> {
        self.inner.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, run_id: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.active().insert(run_id.to_string(), tx);
        rx
    }

    /// Run `entry` from the current workspace in the background.
    pub fn run(&self, entry: &str) -> Result<RunHandle, RunnerError> {
        let snapshot = self.inner.workspace.get_current().ok_or(RunnerError::NoWorkspace)?;
        let run_id = uuid::Uuid::new_v4().to_string();
        let request = bundle::prepare(&run_id, &snapshot.contents(), entry)?;
        let stop = self.register(&run_id);

        tracing::info!(%run_id, entry, "run started");
        self.inner.bus.publish(Event::RunStarted {
            run_id: run_id.clone(),
            entry: entry.to_string(),
        });

        let this = self.clone();
        let timeout = self.inner.settings.default_timeout;
        let join = tokio::spawn(async move { this.execute(request, timeout, stop, true).await });
        Ok(RunHandle { run_id, join })
    }

    /// Run `files` starting at `entry` and wait for the result.
    pub async fn run_project_and_capture(
        &self,
        files: &BTreeMap<String, String>,
        entry: &str,
        timeout: Duration,
    ) -> RunResult {
        let run_id = uuid::Uuid::new_v4().to_string();
        let request = match bundle::prepare(&run_id, files, entry) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(%run_id, entry, error = %e, "run could not be prepared");
                return RunResult::failed(run_id, e.to_string());
            }
        };
        let stop = self.register(&run_id);
        self.execute(request, timeout, stop, false).await
    }

    /// Test files in `files` that the backend can run.
    pub fn test_files(&self, files: &BTreeMap<String, String>) -> Vec<String> {
        find_test_files(files.keys().map(String::as_str), &self.inner.settings.test_patterns)
            .into_iter()
            .filter(|path| self.inner.backend.supports(language_for_path(path)))
            .collect()
    }

    /// Run every discovered test file in sequence.
    pub async fn run_tests(&self, files: &BTreeMap<String, String>, timeout: Duration) -> Vec<TestRun> {
        let mut runs = Vec::new();
        for path in self.test_files(files) {
            let result = self.run_project_and_capture(files, &path, timeout).await;
            runs.push(TestRun { path, result });
        }
        runs
    }

    /// Ask run `run_id` to stop. Returns false if it is not active.
    pub fn stop(&self, run_id: &str) -> bool {
        match self.active().remove(run_id) {
            Some(stop) => stop.send(()).is_ok(),
            None => false,
        }
    }

    /// Stop every active run. Returns how many were signalled.
    pub fn stop_all(&self) -> usize {
        let drained: Vec<oneshot::Sender<()>> = self.active().drain().map(|(_, stop)| stop).collect();
        drained
            .into_iter()
            .map(|stop| stop.send(()))
            .filter(Result::is_ok)
            .count()
    }

    pub fn active_runs(&self) -> Vec<String> {
        self.active().keys().cloned().collect()
    }

    async fn execute(
        &self,
        request: LaunchRequest,
        timeout: Duration,
        stop: oneshot::Receiver<()>,
        publish: bool,
    ) -> RunResult {
        let run_id = request.run_id.clone();
        let bus = self.inner.bus.clone();

        let result = match self.inner.backend.launch(request).await {
            Ok(ctx) => {
                driver::drive(&run_id, ctx, timeout, stop, |msg| {
                    if publish {
                        bus.publish(to_event(msg));
                    }
                })
                .await
            }
            Err(e) => {
                let result = RunResult::failed(&run_id, e.to_string());
                if publish {
                    bus.publish(Event::RunFailed {
                        run_id: run_id.clone(),
                        error: e.to_string(),
                    });
                }
                result
            }
        };

        self.active().remove(&run_id);
        match &result.error {
            Some(error) => tracing::warn!(%run_id, %error, "run failed"),
            None => tracing::debug!(%run_id, exit_code = ?result.exit_code, "run finished"),
        }
        result
    }
}

fn to_event(msg: &ContextMessage) -> Event {
    match msg.clone() {
        ContextMessage::Stdout { run_id, text } => Event::RunOutput {
            run_id,
            stream: OutputStream::Stdout,
            text,
        },
        ContextMessage::Stderr { run_id, text } => Event::RunOutput {
            run_id,
            stream: OutputStream::Stderr,
            text,
        },
        ContextMessage::Exit { run_id, code } => Event::RunExited { run_id, code },
        ContextMessage::Error { run_id, error } => Event::RunFailed { run_id, error },
    }
}
