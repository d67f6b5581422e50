//! Uniform data model shared by every provider adapter and the orchestrator.
//!
//! Vendor-native shapes never leave an adapter; everything downstream of
//! `ProviderAdapter::stream` speaks [`StreamEvent`].

use serde::{Deserialize, Serialize};

/// Role of a conversation turn as seen by the relay.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
    System,
}

/// One prior (or current) turn handed to a provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::System,
            content: content.into(),
        }
    }
}

/// Vendor-neutral generation request. Built once per attempt and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub model_id: String,
    pub system_prompt: String,
    pub turns: Vec<ChatTurn>,
    pub enable_thinking: bool,
    pub enable_web_search: bool,
}

impl GenerationRequest {
    /// Same conversation, different model. Used when switching to a backup.
    pub fn for_model(&self, model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            ..self.clone()
        }
    }
}

/// A web source referenced by a response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Citation {
    pub url: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// Token accounting for one attempt. Adapters report a single snapshot at end of stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
    #[serde(default)]
    pub cached_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_search_requests: Option<u64>,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.reasoning_tokens
    }

    pub fn search_count(&self) -> u64 {
        self.web_search_requests.unwrap_or(0)
    }
}

/// Tool activity notification, e.g. `{tool: "web_search", status: "started"}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolActivity {
    pub tool: String,
    pub status: String,
}

impl ToolActivity {
    pub fn new(tool: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            status: status.into(),
        }
    }
}

/// The only event shape a provider adapter may produce.
///
/// `Done` and `Error` are terminal: an adapter yields nothing after either.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Delta(String),
    Thinking(String),
    Citations(Vec<Citation>),
    ToolUse(ToolActivity),
    Done {
        usage: TokenUsage,
        web_search_used: bool,
    },
    Error(String),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_events() {
        assert!(StreamEvent::Error("x".into()).is_terminal());
        assert!(StreamEvent::Done {
            usage: TokenUsage::default(),
            web_search_used: false
        }
        .is_terminal());
        assert!(!StreamEvent::Delta("x".into()).is_terminal());
        assert!(!StreamEvent::ToolUse(ToolActivity::new("web_search", "started")).is_terminal());
    }

    #[test]
    fn for_model_keeps_conversation() {
        let req = GenerationRequest {
            model_id: "gpt-4.1".into(),
            system_prompt: "be brief".into(),
            turns: vec![ChatTurn::user("hi")],
            enable_thinking: true,
            enable_web_search: false,
        };
        let backup = req.for_model("claude-sonnet-4");
        assert_eq!(backup.model_id, "claude-sonnet-4");
        assert_eq!(backup.turns, req.turns);
        assert!(backup.enable_thinking);
    }

    #[test]
    fn usage_omits_absent_search_count() {
        let usage = TokenUsage {
            input_tokens: 3,
            output_tokens: 4,
            ..Default::default()
        };
        let json = serde_json::to_value(usage).unwrap();
        assert!(json.get("web_search_requests").is_none());
        assert_eq!(usage.total_tokens(), 7);
    }
}
