//! LLM-backed agent roles.
//!
//! An agent call is one request/response round trip: build the role's
//! messages, call the [`LlmClient`], parse the reply into the role's typed
//! shape. Transport failures and malformed replies both surface as
//! [`AgentError`].

pub mod prompts;
pub mod replies;

pub use prompts::{FixPrompt, RunFeedback};
pub use replies::{CoderReply, FileEdit, PlannerReply, ReviewerReply, SummarizerReply, parse_reply};

use serde::de::DeserializeOwned;

use crate::errors::AgentError;
use crate::llm::{CallOptions, ChatMessage, LlmClient, estimate_tokens};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Planner,
    Coder,
    FixCoder,
    Reviewer,
    Summarizer,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Planner => "planner",
            AgentRole::Coder => "coder",
            AgentRole::FixCoder => "fix_coder",
            AgentRole::Reviewer => "reviewer",
            AgentRole::Summarizer => "summarizer",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A parsed reply plus the tokens the call consumed.
#[derive(Debug, Clone)]
pub struct AgentCall<T> {
    pub reply: T,
    pub tokens: u64,
}

/// Call the model for `role` and parse its reply.
///
/// When the client reports no usage, tokens are estimated from the message
/// and reply text.
pub async fn ask<T: DeserializeOwned>(
    llm: &dyn LlmClient,
    role: AgentRole,
    messages: &[ChatMessage],
    options: &CallOptions,
) -> Result<AgentCall<T>, AgentError> {
    tracing::debug!(%role, "calling agent");
    let response = llm.call(messages, options).await.map_err(|source| AgentError::Llm {
        role: role.to_string(),
        source,
    })?;

    let tokens = match response.usage {
        Some(usage) => usage.total_tokens,
        None => {
            messages.iter().map(|m| estimate_tokens(&m.content)).sum::<u64>()
                + estimate_tokens(&response.content)
        }
    };

    let reply = parse_reply(role, &response.content)?;
    Ok(AgentCall { reply, tokens })
}
