//! Anthropic Messages adapter.
//!
//! The event translator is shared with the Bedrock adapter, which receives the same
//! event objects wrapped in AWS event-stream chunks instead of SSE frames.

use serde_json::{json, Value};

use crate::models::{Citation, GenerationRequest, StreamEvent, TokenUsage, ToolActivity, TurnRole};
use crate::provider::{
    drive_sse, join_url, CitationCollector, EventStream, ProviderAdapter, SseFrame,
    SseTranslator, Vendor,
};

pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

const DEFAULT_MAX_TOKENS: u64 = 4096;
const THINKING_BUDGET_TOKENS: u64 = 2048;
const THINKING_MAX_TOKENS: u64 = 8192;
const WEB_SEARCH_MAX_USES: u64 = 5;

pub struct AnthropicAdapter {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AnthropicAdapter {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn vendor(&self) -> Vendor {
        Vendor::Anthropic
    }

    fn stream(&self, request: GenerationRequest) -> EventStream {
        let url = join_url(&self.base_url, "messages");
        let mut body = build_messages_body(&request);
        body["model"] = json!(request.model_id);
        body["stream"] = json!(true);
        tracing::debug!(model = %request.model_id, "anthropic messages request");
        let builder = self
            .http
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);
        drive_sse(Vendor::Anthropic, builder, MessagesTranslator::new())
    }
}

/// Extended thinking is available on Claude 3.7 and the Claude 4 family.
pub(crate) fn supports_thinking(model: &str) -> bool {
    let m = model.to_ascii_lowercase();
    m.contains("claude-3-7")
        || m.contains("claude-sonnet-4")
        || m.contains("claude-opus-4")
        || m.contains("claude-4")
}

pub(crate) fn supports_web_search(model: &str) -> bool {
    let m = model.to_ascii_lowercase();
    supports_thinking(&m) || m.contains("claude-3-5")
}

/// Build the vendor body without `model`/`stream`, which differ between the direct
/// API and Bedrock.
pub(crate) fn build_messages_body(request: &GenerationRequest) -> Value {
    let mut system_parts: Vec<&str> = Vec::new();
    if !request.system_prompt.trim().is_empty() {
        system_parts.push(&request.system_prompt);
    }
    let mut messages = Vec::with_capacity(request.turns.len());
    for turn in &request.turns {
        match turn.role {
            TurnRole::System => system_parts.push(&turn.content),
            TurnRole::User => messages.push(json!({"role": "user", "content": turn.content})),
            TurnRole::Assistant => {
                messages.push(json!({"role": "assistant", "content": turn.content}))
            }
        }
    }

    let thinking = request.enable_thinking && supports_thinking(&request.model_id);
    let mut body = json!({
        "messages": messages,
        "max_tokens": if thinking { THINKING_MAX_TOKENS } else { DEFAULT_MAX_TOKENS },
    });
    if !system_parts.is_empty() {
        body["system"] = json!(system_parts.join("\n\n"));
    }
    if thinking {
        body["thinking"] = json!({"type": "enabled", "budget_tokens": THINKING_BUDGET_TOKENS});
    }
    if request.enable_web_search && supports_web_search(&request.model_id) {
        body["tools"] = json!([{
            "type": "web_search_20250305",
            "name": "web_search",
            "max_uses": WEB_SEARCH_MAX_USES,
        }]);
    }
    body
}

/// Translates Messages streaming events (`message_start` .. `message_stop`).
pub(crate) struct MessagesTranslator {
    citations: CitationCollector,
    usage: TokenUsage,
    searches: u64,
    finished: bool,
}

impl MessagesTranslator {
    pub(crate) fn new() -> Self {
        Self {
            citations: CitationCollector::new(),
            usage: TokenUsage::default(),
            searches: 0,
            finished: false,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    /// Override usage from an out-of-band source (Bedrock invocation metrics).
    pub(crate) fn set_token_counts(&mut self, input: u64, output: u64) {
        self.usage.input_tokens = input;
        self.usage.output_tokens = output;
    }

    pub(crate) fn complete(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let web_search_used = !self.citations.is_empty() || self.searches > 0;
        if self.searches > 0 {
            self.usage.web_search_requests = Some(self.searches);
        }
        let mut out = Vec::new();
        if let Some(ev) = self.citations.take_event() {
            out.push(ev);
        }
        out.push(StreamEvent::Done {
            usage: self.usage,
            web_search_used,
        });
        out
    }

    pub(crate) fn fail(&mut self, message: String) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        vec![StreamEvent::Error(message)]
    }

    pub(crate) fn on_event(&mut self, event: &Value) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        let mut out = Vec::new();
        match event["type"].as_str().unwrap_or_default() {
            "message_start" => {
                let usage = &event["message"]["usage"];
                self.usage.input_tokens = usage["input_tokens"].as_u64().unwrap_or(0);
                self.usage.cached_tokens = usage["cache_read_input_tokens"].as_u64().unwrap_or(0);
                self.usage.output_tokens = usage["output_tokens"].as_u64().unwrap_or(0);
            }
            "content_block_start" => {
                let block = &event["content_block"];
                match block["type"].as_str().unwrap_or_default() {
                    "server_tool_use" => {
                        self.searches += 1;
                        let tool = block["name"].as_str().unwrap_or("web_search");
                        out.push(StreamEvent::ToolUse(ToolActivity::new(tool, "started")));
                    }
                    "web_search_tool_result" => {
                        match block["content"].as_array() {
                            Some(results) => {
                                for result in results {
                                    if let Some(url) = result["url"].as_str() {
                                        self.citations.add(Citation {
                                            url: url.to_string(),
                                            title: result["title"].as_str().unwrap_or_default().to_string(),
                                            snippet: None,
                                        });
                                    }
                                }
                                out.push(StreamEvent::ToolUse(ToolActivity::new("web_search", "completed")));
                            }
                            None => {
                                out.push(StreamEvent::ToolUse(ToolActivity::new("web_search", "failed")));
                            }
                        }
                    }
                    "text" => {
                        if let Some(text) = block["text"].as_str().filter(|t| !t.is_empty()) {
                            out.push(StreamEvent::Delta(text.to_string()));
                        }
                    }
                    _ => {}
                }
            }
            "content_block_delta" => {
                let delta = &event["delta"];
                match delta["type"].as_str().unwrap_or_default() {
                    "text_delta" => {
                        if let Some(text) = delta["text"].as_str().filter(|t| !t.is_empty()) {
                            out.push(StreamEvent::Delta(text.to_string()));
                        }
                    }
                    "thinking_delta" => {
                        if let Some(text) = delta["thinking"].as_str().filter(|t| !t.is_empty()) {
                            out.push(StreamEvent::Thinking(text.to_string()));
                        }
                    }
                    "citations_delta" => {
                        let citation = &delta["citation"];
                        if let Some(url) = citation["url"].as_str() {
                            self.citations.add(Citation {
                                url: url.to_string(),
                                title: citation["title"].as_str().unwrap_or_default().to_string(),
                                snippet: citation["cited_text"].as_str().map(str::to_string),
                            });
                        }
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                let usage = &event["usage"];
                if let Some(output) = usage["output_tokens"].as_u64() {
                    self.usage.output_tokens = output;
                }
                if let Some(n) = usage
                    .pointer("/server_tool_use/web_search_requests")
                    .and_then(|v| v.as_u64())
                {
                    self.searches = self.searches.max(n);
                }
            }
            "message_stop" => {
                out.extend(self.complete());
            }
            "error" => {
                let message = event
                    .pointer("/error/message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown error");
                out.extend(self.fail(format!("anthropic stream error: {}", message)));
            }
            _ => {}
        }
        out
    }
}

impl SseTranslator for MessagesTranslator {
    fn on_frame(&mut self, frame: &SseFrame) -> Vec<StreamEvent> {
        match serde_json::from_str::<Value>(&frame.data) {
            Ok(event) => self.on_event(&event),
            Err(e) => {
                tracing::debug!("Skipping unparseable anthropic frame: {}", e);
                Vec::new()
            }
        }
    }

    fn on_end(&mut self) -> Vec<StreamEvent> {
        self.fail("anthropic stream ended before message_stop".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatTurn;

    fn feed(t: &mut MessagesTranslator, events: &[Value]) -> Vec<StreamEvent> {
        events.iter().flat_map(|e| t.on_event(e)).collect()
    }

    #[test]
    fn test_body_lifts_system_turns() {
        let req = GenerationRequest {
            model_id: "claude-sonnet-4-20250514".into(),
            system_prompt: "Base prompt".into(),
            turns: vec![
                ChatTurn::system("Extra rule"),
                ChatTurn::user("hi"),
                ChatTurn::assistant("hello"),
            ],
            enable_thinking: true,
            enable_web_search: true,
        };
        let body = build_messages_body(&req);
        assert_eq!(body["system"], "Base prompt\n\nExtra rule");
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
        assert_eq!(body["thinking"]["budget_tokens"], THINKING_BUDGET_TOKENS);
        assert_eq!(body["max_tokens"], THINKING_MAX_TOKENS);
        assert_eq!(body["tools"][0]["name"], "web_search");
    }

    #[test]
    fn test_body_without_capabilities() {
        let req = GenerationRequest {
            model_id: "claude-3-haiku-20240307".into(),
            system_prompt: String::new(),
            turns: vec![ChatTurn::user("hi")],
            enable_thinking: true,
            enable_web_search: true,
        };
        let body = build_messages_body(&req);
        assert!(body.get("thinking").is_none());
        assert!(body.get("tools").is_none());
        assert!(body.get("system").is_none());
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn test_translates_thinking_search_and_usage() {
        let mut t = MessagesTranslator::new();
        let events = feed(
            &mut t,
            &[
                json!({"type":"message_start","message":{"usage":{"input_tokens":25,"output_tokens":1,"cache_read_input_tokens":3}}}),
                json!({"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":""}}),
                json!({"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"Let me look"}}),
                json!({"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"abc"}}),
                json!({"type":"content_block_start","index":1,"content_block":{"type":"server_tool_use","id":"t1","name":"web_search"}}),
                json!({"type":"content_block_start","index":2,"content_block":{"type":"web_search_tool_result","content":[{"type":"web_search_result","url":"https://rust-lang.org","title":"Rust"}]}}),
                json!({"type":"content_block_delta","index":3,"delta":{"type":"citations_delta","citation":{"type":"web_search_result_location","url":"https://rust-lang.org","title":"Rust","cited_text":"A language"}}}),
                json!({"type":"content_block_delta","index":3,"delta":{"type":"text_delta","text":"Rust is"}}),
                json!({"type":"ping"}),
                json!({"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":40,"server_tool_use":{"web_search_requests":1}}}),
                json!({"type":"message_stop"}),
            ],
        );

        assert_eq!(events[0], StreamEvent::Thinking("Let me look".into()));
        assert_eq!(
            events[1],
            StreamEvent::ToolUse(ToolActivity::new("web_search", "started"))
        );
        assert_eq!(
            events[2],
            StreamEvent::ToolUse(ToolActivity::new("web_search", "completed"))
        );
        assert_eq!(events[3], StreamEvent::Delta("Rust is".into()));
        match &events[4] {
            StreamEvent::Citations(items) => {
                assert_eq!(items.len(), 1);
                // result block had no snippet, the citation delta fills it in
                assert_eq!(items[0].snippet.as_deref(), Some("A language"));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(
            events[5],
            StreamEvent::Done {
                usage: TokenUsage {
                    input_tokens: 25,
                    output_tokens: 40,
                    reasoning_tokens: 0,
                    cached_tokens: 3,
                    web_search_requests: Some(1),
                },
                web_search_used: true,
            }
        );
        assert_eq!(events.len(), 6);
        assert!(t.on_end().is_empty());
    }

    #[test]
    fn test_error_event_and_truncation() {
        let mut t = MessagesTranslator::new();
        let events = feed(
            &mut t,
            &[json!({"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}})],
        );
        assert_eq!(
            events,
            vec![StreamEvent::Error("anthropic stream error: Overloaded".into())]
        );

        let mut t = MessagesTranslator::new();
        feed(&mut t, &[json!({"type":"content_block_delta","delta":{"type":"text_delta","text":"x"}})]);
        assert!(matches!(t.on_end().as_slice(), [StreamEvent::Error(_)]));
    }
}
