//! Execution contexts.
//!
//! A [`SandboxBackend`] turns a [`LaunchRequest`] into a live context that
//! streams [`ContextMessage`]s. [`ProcessBackend`] runs each program in a
//! fresh interpreter process inside its own temp directory.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc, oneshot};

use super::types::{ContextMessage, LaunchRequest};
use crate::errors::RunnerError;

/// Capacity of the per-context message channel.
const MESSAGE_BUFFER: usize = 256;

/// How long to keep draining pipes after the process exits.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Handle for tearing a context down. Calling it more than once is harmless.
#[async_trait]
pub trait ContextControl: Send + Sync {
    async fn terminate(&self);
}

/// A launched execution context.
pub struct LaunchedContext {
    pub messages: mpsc::Receiver<ContextMessage>,
    pub control: Box<dyn ContextControl>,
}

/// Abstraction over execution environments for testability.
/// Real implementation: `ProcessBackend`.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    async fn launch(&self, request: LaunchRequest) -> Result<LaunchedContext, RunnerError>;

    /// Whether programs in `language` can be launched at all.
    fn supports(&self, _language: &str) -> bool {
        true
    }
}

/// Default interpreter table. Each argv reads the program from stdin.
pub fn default_interpreters() -> HashMap<String, Vec<String>> {
    HashMap::from([
        ("javascript".to_string(), vec!["node".to_string(), "-".to_string()]),
        ("python".to_string(), vec!["python3".to_string(), "-".to_string()]),
    ])
}

/// Runs programs as child processes.
///
/// Each launch gets a new temp directory as its working directory and
/// `HOME`, a cleared environment apart from `PATH`, and `kill_on_drop`.
pub struct ProcessBackend {
    interpreters: HashMap<String, Vec<String>>,
    path_env: String,
}

impl ProcessBackend {
    pub fn new(interpreters: HashMap<String, Vec<String>>) -> Self {
        Self {
            interpreters,
            path_env: std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string()),
        }
    }
}

impl Default for ProcessBackend {
    fn default() -> Self {
        Self::new(default_interpreters())
    }
}

struct ProcessControl {
    kill: Mutex<Option<oneshot::Sender<()>>>,
}

#[async_trait]
impl ContextControl for ProcessControl {
    async fn terminate(&self) {
        if let Some(kill) = self.kill.lock().await.take() {
            let _ = kill.send(());
        }
    }
}

#[async_trait]
impl SandboxBackend for ProcessBackend {
    async fn launch(&self, request: LaunchRequest) -> Result<LaunchedContext, RunnerError> {
        let argv = self
            .interpreters
            .get(&request.language)
            .filter(|argv| !argv.is_empty())
            .ok_or_else(|| RunnerError::NoInterpreter {
                language: request.language.clone(),
            })?;

        let dir = tempfile::Builder::new()
            .prefix("codeloop-run-")
            .tempdir()
            .map_err(RunnerError::Sandbox)?;
        for (path, content) in &request.support_files {
            let target = dir.path().join(path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(RunnerError::Sandbox)?;
            }
            tokio::fs::write(&target, content).await.map_err(RunnerError::Sandbox)?;
        }

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(dir.path())
            .env_clear()
            .env("PATH", &self.path_env)
            .env("HOME", dir.path())
            .env("NODE_DISABLE_COLORS", "1")
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(RunnerError::Launch)?;
        tracing::debug!(run_id = %request.run_id, interpreter = %argv[0], pid = child.id(), "context launched");

        let (tx, rx) = mpsc::channel(MESSAGE_BUFFER);
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        if let Some(mut stdin) = child.stdin.take() {
            let code = request.code;
            tokio::spawn(async move {
                // A program that exits without reading stdin closes the pipe early.
                let _ = stdin.write_all(code.as_bytes()).await;
                let _ = stdin.shutdown().await;
            });
        }

        let run_id = request.run_id;
        let stdout_task = child.stdout.take().map(|out| {
            tokio::spawn(pump(out, tx.clone(), run_id.clone(), |run_id, text| ContextMessage::Stdout {
                run_id,
                text,
            }))
        });
        let stderr_task = child.stderr.take().map(|err| {
            tokio::spawn(pump(err, tx.clone(), run_id.clone(), |run_id, text| ContextMessage::Stderr {
                run_id,
                text,
            }))
        });

        tokio::spawn(async move {
            // Keep the sandbox directory alive until the process is gone.
            let _dir = dir;

            let terminal = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => match status.code() {
                        Some(code) => ContextMessage::Exit { run_id: run_id.clone(), code },
                        None => ContextMessage::Error {
                            run_id: run_id.clone(),
                            error: format!("Process terminated by signal ({})", status),
                        },
                    },
                    Err(e) => ContextMessage::Error {
                        run_id: run_id.clone(),
                        error: format!("Failed to wait for process: {}", e),
                    },
                },
                _ = &mut kill_rx => {
                    let _ = child.kill().await;
                    for task in [&stdout_task, &stderr_task].into_iter().flatten() {
                        task.abort();
                    }
                    tracing::debug!(%run_id, "context terminated");
                    return;
                }
            };

            for mut task in [stdout_task, stderr_task].into_iter().flatten() {
                if tokio::time::timeout(DRAIN_GRACE, &mut task).await.is_err() {
                    tracing::debug!(%run_id, "output pipe still open after exit");
                    task.abort();
                }
            }
            let _ = tx.send(terminal).await;
        });

        Ok(LaunchedContext {
            messages: rx,
            control: Box::new(ProcessControl {
                kill: Mutex::new(Some(kill_tx)),
            }),
        })
    }

    fn supports(&self, language: &str) -> bool {
        self.interpreters.contains_key(language)
    }
}

/// Forward decoded chunks from a pipe until EOF. A multi-byte character
/// split across reads is held back until its remaining bytes arrive.
async fn pump<R, F>(mut reader: R, tx: mpsc::Sender<ContextMessage>, run_id: String, wrap: F)
where
    R: AsyncRead + Unpin,
    F: Fn(String, String) -> ContextMessage,
{
    let mut buf = vec![0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let text = take_decoded(&mut pending);
                if text.is_empty() {
                    continue;
                }
                if tx.send(wrap(run_id.clone(), text)).await.is_err() {
                    return;
                }
            }
        }
    }
    if !pending.is_empty() {
        let text = String::from_utf8_lossy(&pending).into_owned();
        let _ = tx.send(wrap(run_id, text)).await;
    }
}

/// Drain the decodable prefix of `pending`, leaving an incomplete trailing
/// sequence in place. Invalid bytes are replaced.
fn take_decoded(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();
    let mut rest: &[u8] = pending;
    loop {
        match std::str::from_utf8(rest) {
            Ok(s) => {
                out.push_str(s);
                rest = &[];
                break;
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                out.push_str(&String::from_utf8_lossy(valid));
                match e.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        rest = &after[bad..];
                    }
                    None => {
                        rest = after;
                        break;
                    }
                }
            }
        }
    }
    let keep = rest.len();
    let consumed = pending.len() - keep;
    pending.drain(..consumed);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn request(language: &str, code: &str) -> LaunchRequest {
        LaunchRequest {
            run_id: "r1".into(),
            language: language.into(),
            code: code.into(),
            support_files: BTreeMap::new(),
        }
    }

    async fn collect(mut ctx: LaunchedContext) -> Vec<ContextMessage> {
        let mut out = Vec::new();
        while let Some(msg) = ctx.messages.recv().await {
            let terminal = msg.is_terminal();
            out.push(msg);
            if terminal {
                break;
            }
        }
        out
    }

    fn sh_backend() -> ProcessBackend {
        ProcessBackend::new(HashMap::from([(
            "shell".to_string(),
            vec!["sh".to_string(), "-s".to_string()],
        )]))
    }

    #[tokio::test]
    async fn test_unknown_language_is_rejected() {
        let backend = ProcessBackend::new(HashMap::new());
        let err = backend.launch(request("cobol", "")).await.err().unwrap();
        assert!(matches!(err, RunnerError::NoInterpreter { .. }));
        assert!(!backend.supports("cobol"));
    }

    #[tokio::test]
    async fn test_process_streams_output_then_exit() {
        let backend = sh_backend();
        let ctx = backend
            .launch(request("shell", "echo out; echo err 1>&2; exit 3"))
            .await
            .unwrap();
        let messages = collect(ctx).await;

        let stdout: String = messages
            .iter()
            .filter_map(|m| match m {
                ContextMessage::Stdout { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(stdout.trim(), "out");
        assert!(messages.iter().any(|m| matches!(m, ContextMessage::Stderr { text, .. } if text.contains("err"))));
        assert_eq!(
            messages.last(),
            Some(&ContextMessage::Exit {
                run_id: "r1".into(),
                code: 3
            })
        );
    }

    #[test]
    fn test_take_decoded_holds_back_split_character() {
        let mut pending = b"ab\xc3".to_vec();
        assert_eq!(take_decoded(&mut pending), "ab");
        assert_eq!(pending, b"\xc3");

        pending.extend_from_slice(b"\xa9!");
        assert_eq!(take_decoded(&mut pending), "\u{e9}!");
        assert!(pending.is_empty());

        let mut invalid = b"a\xffb".to_vec();
        assert_eq!(take_decoded(&mut invalid), "a\u{FFFD}b");
        assert!(invalid.is_empty());
    }

    #[tokio::test]
    async fn test_multibyte_output_across_read_boundary() {
        let backend = sh_backend();
        let ctx = backend
            .launch(request("shell", "printf '%4095s\\303\\251\\n' ''"))
            .await
            .unwrap();
        let messages = collect(ctx).await;

        let stdout: String = messages
            .iter()
            .filter_map(|m| match m {
                ContextMessage::Stdout { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert!(!stdout.contains(char::REPLACEMENT_CHARACTER));
        assert!(stdout.ends_with("\u{e9}\n"));
        assert_eq!(stdout.chars().count(), 4097);
    }

    #[tokio::test]
    async fn test_environment_is_cleared_and_cwd_is_private() {
        // SAFETY: test-only env mutation; no other test reads this variable.
        unsafe { std::env::set_var("CODELOOP_SECRET_FOR_TEST", "leak") };
        let backend = sh_backend();
        let mut req = request("shell", "cat data.txt; echo \"[$CODELOOP_SECRET_FOR_TEST]\"");
        req.support_files.insert("data.txt".into(), "from-support\n".into());
        let messages = collect(backend.launch(req).await.unwrap()).await;

        let stdout: String = messages
            .iter()
            .filter_map(|m| match m {
                ContextMessage::Stdout { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert!(stdout.contains("from-support"));
        assert!(stdout.contains("[]"));
    }

    #[tokio::test]
    async fn test_terminate_kills_process_without_terminal_message() {
        let backend = sh_backend();
        let mut ctx = backend.launch(request("shell", "sleep 30")).await.unwrap();
        ctx.control.terminate().await;
        ctx.control.terminate().await;

        let next = tokio::time::timeout(Duration::from_secs(5), ctx.messages.recv())
            .await
            .unwrap();
        assert!(next.is_none());
    }
}
