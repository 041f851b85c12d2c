//! Typed agent replies.
//!
//! Every role answers with one JSON object. Text around the object is
//! tolerated; a missing object or a shape mismatch is a protocol error.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::AgentRole;
use crate::errors::AgentError;
use crate::memory::Outcome;
use crate::util::{extract_json_object, truncate_chars};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerReply {
    #[serde(default)]
    pub notes: String,
    #[serde(default, alias = "focus_paths")]
    pub focus_paths: Vec<String>,
}

/// Full replacement content for one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEdit {
    pub path: String,
    #[serde(default)]
    pub language: String,
    #[serde(alias = "new_content")]
    pub new_content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoderReply {
    #[serde(default)]
    pub notes: String,
    pub edits: Vec<FileEdit>,
}

/// `edits: None` accepts the coder's edits as they are; `Some(vec![])`
/// rejects all of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewerReply {
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub edits: Option<Vec<FileEdit>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummarizerReply {
    pub summary: String,
    pub outcome: Outcome,
}

/// Parse a role reply out of raw model output.
pub fn parse_reply<T: DeserializeOwned>(role: AgentRole, text: &str) -> Result<T, AgentError> {
    let json = extract_json_object(text).ok_or_else(|| AgentError::Protocol {
        role: role.to_string(),
        message: format!("no JSON object in reply: {}", truncate_chars(text.trim(), 120)),
    })?;

    serde_json::from_str(&json).map_err(|e| AgentError::Protocol {
        role: role.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_coder_reply() {
        let text = r#"Here you go:
{"notes": "added a log", "edits": [{"path": "main.js", "language": "javascript", "newContent": "console.log(1);\n"}]}"#;
        let reply: CoderReply = parse_reply(AgentRole::Coder, text).unwrap();
        assert_eq!(reply.notes, "added a log");
        assert_eq!(reply.edits.len(), 1);
        assert_eq!(reply.edits[0].new_content, "console.log(1);\n");
    }

    #[test]
    fn test_parse_coder_reply_requires_edits() {
        let err = parse_reply::<CoderReply>(AgentRole::Coder, r#"{"notes": "nothing"}"#).unwrap_err();
        match err {
            AgentError::Protocol { role, message } => {
                assert_eq!(role, "coder");
                assert!(message.contains("edits"));
            }
            other => panic!("Expected Protocol, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_reply_without_json() {
        let err = parse_reply::<PlannerReply>(AgentRole::Planner, "I think main.js").unwrap_err();
        assert!(err.to_string().contains("no JSON object"));
    }

    #[test]
    fn test_parse_planner_reply_snake_case_alias() {
        let reply: PlannerReply =
            parse_reply(AgentRole::Planner, r#"{"focus_paths": ["a.js"]}"#).unwrap();
        assert_eq!(reply.focus_paths, vec!["a.js"]);
        assert!(reply.notes.is_empty());
    }

    #[test]
    fn test_reviewer_edits_absent_vs_empty() {
        let absent: ReviewerReply = parse_reply(AgentRole::Reviewer, r#"{"notes": "ok"}"#).unwrap();
        assert!(absent.edits.is_none());
        let empty: ReviewerReply =
            parse_reply(AgentRole::Reviewer, r#"{"notes": "no", "edits": []}"#).unwrap();
        assert_eq!(empty.edits, Some(vec![]));
    }

    #[test]
    fn test_parse_summarizer_reply() {
        let reply: SummarizerReply = parse_reply(
            AgentRole::Summarizer,
            "```json\n{\"summary\": \"fixed it\", \"outcome\": \"success\"}\n```",
        )
        .unwrap();
        assert_eq!(reply.outcome, Outcome::Success);

        let bad = parse_reply::<SummarizerReply>(
            AgentRole::Summarizer,
            r#"{"summary": "x", "outcome": "great"}"#,
        );
        assert!(bad.is_err());
    }
}
