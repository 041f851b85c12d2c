//! Language-model access.
//!
//! The orchestrator only depends on [`LlmClient`]; how a provider is reached is
//! up to the implementation. [`CommandLlmClient`] pipes a rendered transcript
//! into a CLI model command and treats stdout as the reply.

use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallOptions {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Abstraction over model providers for testability.
/// Real implementation: `CommandLlmClient`.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn call(&self, messages: &[ChatMessage], options: &CallOptions) -> Result<LlmResponse>;
}

/// Rough token estimate (about four characters per token) for providers that
/// report no usage.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Render messages as one plain-text prompt.
pub fn render_transcript(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for message in messages {
        match message.role {
            Role::System => {
                out.push_str(&message.content);
                out.push_str("\n\n");
            }
            Role::User | Role::Assistant => {
                out.push_str(&format!("## {}\n\n{}\n\n", message.role.as_str(), message.content));
            }
        }
    }
    out.trim_end().to_string()
}

/// Runs a model CLI per call: `<command> <args..> [--model M]`, transcript on
/// stdin, reply on stdout.
#[derive(Debug, Clone)]
pub struct CommandLlmClient {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandLlmClient {
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
        }
    }
}

#[async_trait]
impl LlmClient for CommandLlmClient {
    async fn call(&self, messages: &[ChatMessage], options: &CallOptions) -> Result<LlmResponse> {
        let start = Instant::now();
        let prompt = render_transcript(messages);
        tracing::debug!(command = %self.command, prompt_chars = prompt.len(), "invoking model command");

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        if let Some(model) = &options.model {
            cmd.arg("--model").arg(model);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn model command '{}'", self.command))?;

        let mut stdin = child.stdin.take().context("Failed to get stdin")?;
        let mut stdout = child.stdout.take().context("Failed to get stdout")?;
        let mut stderr = child.stderr.take().context("Failed to get stderr")?;

        // Stdin is fed while both pipes drain; all three sit under the timeout.
        let bytes = prompt.as_bytes();
        let feed = async move {
            let written = stdin.write_all(bytes).await;
            let _ = stdin.shutdown().await;
            written
        };
        let collect = async {
            let mut out = String::new();
            let mut err = String::new();
            let (written, read_out, read_err) = tokio::join!(
                feed,
                stdout.read_to_string(&mut out),
                stderr.read_to_string(&mut err)
            );
            if let Err(e) = written {
                tracing::debug!(error = %e, "model command closed stdin early");
            }
            read_out.context("Failed to read model output")?;
            read_err.context("Failed to read model stderr")?;
            let status = child.wait().await.context("Failed to wait for model command")?;
            anyhow::Ok((status, out, err))
        };

        let (status, content, err) = tokio::time::timeout(self.timeout, collect)
            .await
            .map_err(|_| anyhow::anyhow!("Model command timed out after {}s", self.timeout.as_secs()))??;

        let duration_ms = start.elapsed().as_millis() as u64;
        tracing::debug!(duration_ms, exit = ?status.code(), reply_chars = content.len(), "model command finished");

        if !status.success() {
            anyhow::bail!(
                "Model command exited with code {}: {}",
                status.code().unwrap_or(-1),
                err.trim()
            );
        }

        let prompt_tokens = estimate_tokens(&prompt);
        let completion_tokens = estimate_tokens(&content);
        Ok(LlmResponse {
            content,
            usage: Some(Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            }),
            finish_reason: Some("stop".to_string()),
        })
    }
}
