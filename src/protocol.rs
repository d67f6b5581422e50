//! Outward event protocol.
//!
//! Every record is one JSON object per line: `{"type": "...", "data": ...}`.
//! Clients read the stream until a `done` record or a terminal `error` record.

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::models::{Citation, TokenUsage, ToolActivity};
use crate::router_client::ModelCandidate;

/// Content type used for the chat stream response.
pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Machine readable error codes carried in `error` records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    NoUsableProvider,
    UnsupportedTask,
    ProviderRetry,
    ProviderError,
    AllProvidersFailed,
    PersistenceError,
    RouterError,
}

impl ErrorCode {
    /// Only retry notices keep the stream open.
    pub fn is_terminal(self) -> bool {
        !matches!(self, ErrorCode::ProviderRetry)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::NoUsableProvider => "NO_USABLE_PROVIDER",
            ErrorCode::UnsupportedTask => "UNSUPPORTED_TASK",
            ErrorCode::ProviderRetry => "PROVIDER_RETRY",
            ErrorCode::ProviderError => "PROVIDER_ERROR",
            ErrorCode::AllProvidersFailed => "ALL_PROVIDERS_FAILED",
            ErrorCode::PersistenceError => "PERSISTENCE_ERROR",
            ErrorCode::RouterError => "ROUTER_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backup entry as announced in the routing record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupSummary {
    pub model: String,
    pub vendor: String,
    pub score: f64,
}

impl From<&ModelCandidate> for BackupSummary {
    fn from(candidate: &ModelCandidate) -> Self {
        Self {
            model: candidate.id.clone(),
            vendor: candidate.vendor.clone(),
            score: candidate.score,
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingPayload {
    pub model: String,
    pub model_name: String,
    pub vendor: String,
    pub backups: Vec<BackupSummary>,
    pub analysis: String,
    pub confidence: f64,
    pub reasoning: String,
    pub is_manual_override: bool,
    /// Set when the oracle's first choice was skipped because its vendor is unusable.
    pub provider_hint: Option<String>,
    /// Passed through from the oracle, e.g. "a higher tier unlocks claude-opus-4".
    pub upgrade_hint: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LatencyBreakdown {
    pub routing_ms: u64,
    pub attempt_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DonePayload {
    pub message_id: String,
    pub model: String,
    pub vendor: String,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub latency: LatencyBreakdown,
    pub fallback_used: bool,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub message: String,
    pub code: ErrorCode,
    pub category: Option<String>,
    pub alternatives: Option<Vec<String>>,
    pub failed_model: Option<String>,
    pub next_model: Option<String>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
            category: None,
            alternatives: None,
            failed_model: None,
            next_model: None,
        }
    }
}

/// One outward record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    Routing(RoutingPayload),
    Thinking(String),
    Delta(String),
    Citations(Vec<Citation>),
    ToolUse(ToolActivity),
    Done(DonePayload),
    Error(ErrorPayload),
}

impl OutboundEvent {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        OutboundEvent::Error(ErrorPayload::new(code, message))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundEvent::Routing(_) => "routing",
            OutboundEvent::Thinking(_) => "thinking",
            OutboundEvent::Delta(_) => "delta",
            OutboundEvent::Citations(_) => "citations",
            OutboundEvent::ToolUse(_) => "tool_use",
            OutboundEvent::Done(_) => "done",
            OutboundEvent::Error(_) => "error",
        }
    }

    /// `done` and every error other than a retry notice end the stream.
    pub fn is_terminal(&self) -> bool {
        match self {
            OutboundEvent::Done(_) => true,
            OutboundEvent::Error(payload) => payload.code.is_terminal(),
            _ => false,
        }
    }

    /// Encode as a single NDJSON line, including the trailing newline.
    pub fn to_line(&self) -> Vec<u8> {
        let mut out = serde_json::to_vec(self).unwrap_or_else(|e| {
            tracing::warn!("Failed to encode {} event: {}", self.kind(), e);
            br#"{"type":"error","data":{"message":"encoding failure","code":"PROVIDER_ERROR"}}"#
                .to_vec()
        });
        out.push(b'\n');
        out
    }
}

/// Parse an NDJSON body back into events. Blank lines are skipped.
pub fn parse_lines(body: &[u8]) -> Result<Vec<OutboundEvent>, serde_json::Error> {
    body.split(|&b| b == b'\n')
        .filter(|line| line.iter().any(|b| !b.is_ascii_whitespace()))
        .map(serde_json::from_slice)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_use_type_and_data() {
        let line = OutboundEvent::Delta("Hi".into()).to_line();
        let value: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(value, json!({"type": "delta", "data": "Hi"}));
        assert_eq!(line.last(), Some(&b'\n'));
    }

    #[test]
    fn tool_use_tag_is_snake_case() {
        let ev = OutboundEvent::ToolUse(ToolActivity::new("web_search", "started"));
        let value = serde_json::to_value(&ev).unwrap();
        assert_eq!(value["type"], "tool_use");
        assert_eq!(value["data"]["tool"], "web_search");
    }

    #[test]
    fn retry_notice_is_not_terminal() {
        let retry = OutboundEvent::error(ErrorCode::ProviderRetry, "switching");
        assert!(!retry.is_terminal());
        let fatal = OutboundEvent::error(ErrorCode::AllProvidersFailed, "nope");
        assert!(fatal.is_terminal());

        let value = serde_json::to_value(&fatal).unwrap();
        assert_eq!(value["data"]["code"], "ALL_PROVIDERS_FAILED");
        assert!(value["data"].get("category").is_none());
    }

    #[test]
    fn parse_lines_round_trips_a_stream() {
        let mut body = Vec::new();
        body.extend(OutboundEvent::Thinking("hmm".into()).to_line());
        body.extend(b"\n");
        body.extend(OutboundEvent::Delta("ok".into()).to_line());
        let events = parse_lines(&body).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], OutboundEvent::Delta("ok".into()));
    }
}
