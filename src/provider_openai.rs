//! OpenAI Chat Completions adapter.

use serde_json::{json, Value};

use crate::models::{Citation, GenerationRequest, StreamEvent, TokenUsage, TurnRole};
use crate::provider::{
    drive_sse, join_url, CitationCollector, EventStream, ProviderAdapter, SseFrame,
    SseTranslator, Vendor,
};

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiAdapter {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiAdapter {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

impl ProviderAdapter for OpenAiAdapter {
    fn vendor(&self) -> Vendor {
        Vendor::OpenAi
    }

    fn stream(&self, request: GenerationRequest) -> EventStream {
        let url = join_url(&self.base_url, "chat/completions");
        let body = build_body(&request);
        tracing::debug!(model = %request.model_id, "openai chat completions request");
        let builder = self.http.post(url).bearer_auth(&self.api_key).json(&body);
        let translator = ChatCompletionsTranslator::new(uses_search_model(&request));
        drive_sse(Vendor::OpenAi, builder, translator)
    }
}

fn is_reasoning_model(model: &str) -> bool {
    let m = model.to_ascii_lowercase();
    ["o1", "o3", "o4"].iter().any(|p| m.starts_with(p))
}

fn uses_search_model(request: &GenerationRequest) -> bool {
    request.enable_web_search && request.model_id.contains("-search-")
}

pub(crate) fn build_body(request: &GenerationRequest) -> Value {
    let mut messages = Vec::with_capacity(request.turns.len() + 1);
    if !request.system_prompt.trim().is_empty() {
        messages.push(json!({"role": "system", "content": request.system_prompt}));
    }
    for turn in &request.turns {
        let role = match turn.role {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
            TurnRole::System => "system",
        };
        messages.push(json!({"role": role, "content": turn.content}));
    }

    let mut body = json!({
        "model": request.model_id,
        "messages": messages,
        "stream": true,
        "stream_options": {"include_usage": true},
    });

    if request.enable_thinking && is_reasoning_model(&request.model_id) {
        body["reasoning_effort"] = json!("high");
    }
    if uses_search_model(request) {
        body["web_search_options"] = json!({});
    }
    body
}

/// Translates `chat.completion.chunk` frames.
pub(crate) struct ChatCompletionsTranslator {
    citations: CitationCollector,
    usage: TokenUsage,
    search_model: bool,
    finish_seen: bool,
    finished: bool,
}

impl ChatCompletionsTranslator {
    pub(crate) fn new(search_model: bool) -> Self {
        Self {
            citations: CitationCollector::new(),
            usage: TokenUsage::default(),
            search_model,
            finish_seen: false,
            finished: false,
        }
    }

    fn complete(&mut self) -> Vec<StreamEvent> {
        self.finished = true;
        let mut out = Vec::new();
        let web_search_used = !self.citations.is_empty() || self.search_model;
        if self.search_model {
            self.usage.web_search_requests = Some(1);
        }
        if let Some(ev) = self.citations.take_event() {
            out.push(ev);
        }
        out.push(StreamEvent::Done {
            usage: self.usage,
            web_search_used,
        });
        out
    }

    fn on_chunk(&mut self, chunk: &Value) -> Vec<StreamEvent> {
        let mut out = Vec::new();

        if let Some(err) = chunk.get("error") {
            let message = err
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            self.finished = true;
            out.push(StreamEvent::Error(format!("openai stream error: {}", message)));
            return out;
        }

        if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
            let prompt = usage["prompt_tokens"].as_u64().unwrap_or(0);
            let completion = usage["completion_tokens"].as_u64().unwrap_or(0);
            let reasoning = usage
                .pointer("/completion_tokens_details/reasoning_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            let cached = usage
                .pointer("/prompt_tokens_details/cached_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            self.usage = TokenUsage {
                input_tokens: prompt,
                output_tokens: completion.saturating_sub(reasoning),
                reasoning_tokens: reasoning,
                cached_tokens: cached,
                web_search_requests: None,
            };
        }

        let choices = chunk
            .get("choices")
            .and_then(|c| c.as_array())
            .cloned()
            .unwrap_or_default();
        for choice in choices {
            let delta = &choice["delta"];
            if let Some(reasoning) = delta
                .get("reasoning_content")
                .or_else(|| delta.get("reasoning"))
                .and_then(|v| v.as_str())
            {
                if !reasoning.is_empty() {
                    out.push(StreamEvent::Thinking(reasoning.to_string()));
                }
            }
            if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    out.push(StreamEvent::Delta(text.to_string()));
                }
            }
            if let Some(annotations) = delta.get("annotations").and_then(|v| v.as_array()) {
                for annotation in annotations {
                    if annotation["type"] != "url_citation" {
                        continue;
                    }
                    let inner = &annotation["url_citation"];
                    if let Some(url) = inner["url"].as_str() {
                        self.citations.add(Citation {
                            url: url.to_string(),
                            title: inner["title"].as_str().unwrap_or_default().to_string(),
                            snippet: None,
                        });
                    }
                }
            }
            if choice
                .get("finish_reason")
                .map(|f| !f.is_null())
                .unwrap_or(false)
            {
                self.finish_seen = true;
            }
        }
        out
    }
}

impl SseTranslator for ChatCompletionsTranslator {
    fn on_frame(&mut self, frame: &SseFrame) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        if frame.is_done_marker() {
            return self.complete();
        }
        match serde_json::from_str::<Value>(&frame.data) {
            Ok(chunk) => self.on_chunk(&chunk),
            Err(e) => {
                tracing::debug!("Skipping unparseable openai frame: {}", e);
                Vec::new()
            }
        }
    }

    fn on_end(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        if self.finish_seen {
            return self.complete();
        }
        self.finished = true;
        vec![StreamEvent::Error(
            "openai stream ended before completion".to_string(),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatTurn;

    fn frame(data: &str) -> SseFrame {
        SseFrame {
            event: None,
            data: data.to_string(),
        }
    }

    fn request(model: &str) -> GenerationRequest {
        GenerationRequest {
            model_id: model.to_string(),
            system_prompt: "You are helpful.".to_string(),
            turns: vec![ChatTurn::user("hi"), ChatTurn::assistant("hello"), ChatTurn::user("again")],
            enable_thinking: true,
            enable_web_search: true,
        }
    }

    #[test]
    fn test_body_for_reasoning_model() {
        let body = build_body(&request("o4-mini"));
        assert_eq!(body["reasoning_effort"], "high");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"].as_array().unwrap().len(), 4);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert!(body.get("web_search_options").is_none());
    }

    #[test]
    fn test_body_toggles_are_noops_without_capability() {
        let body = build_body(&request("gpt-4.1"));
        assert!(body.get("reasoning_effort").is_none());
        assert!(body.get("web_search_options").is_none());

        let search = build_body(&request("gpt-4o-search-preview"));
        assert!(search.get("web_search_options").is_some());
    }

    #[test]
    fn test_translates_text_usage_and_done() {
        let mut t = ChatCompletionsTranslator::new(false);
        let mut events = Vec::new();
        events.extend(t.on_frame(&frame(r#"{"choices":[{"delta":{"role":"assistant","content":""}}]}"#)));
        events.extend(t.on_frame(&frame(r#"{"choices":[{"delta":{"content":"Hi"}}]}"#)));
        events.extend(t.on_frame(&frame(r#"{"choices":[{"delta":{"content":" there"},"finish_reason":"stop"}]}"#)));
        events.extend(t.on_frame(&frame(
            r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":7,"completion_tokens_details":{"reasoning_tokens":5},"prompt_tokens_details":{"cached_tokens":4}}}"#,
        )));
        events.extend(t.on_frame(&frame("[DONE]")));
        assert!(t.on_end().is_empty());

        assert_eq!(
            events,
            vec![
                StreamEvent::Delta("Hi".into()),
                StreamEvent::Delta(" there".into()),
                StreamEvent::Done {
                    usage: TokenUsage {
                        input_tokens: 10,
                        output_tokens: 2,
                        reasoning_tokens: 5,
                        cached_tokens: 4,
                        web_search_requests: None,
                    },
                    web_search_used: false,
                },
            ]
        );
    }

    #[test]
    fn test_annotations_become_one_citations_event() {
        let mut t = ChatCompletionsTranslator::new(true);
        let annotated = r#"{"choices":[{"delta":{"content":"See","annotations":[{"type":"url_citation","url_citation":{"url":"https://a.example","title":"A"}},{"type":"url_citation","url_citation":{"url":"https://a.example","title":"A again"}}]}}]}"#;
        let first = t.on_frame(&frame(annotated));
        assert_eq!(first, vec![StreamEvent::Delta("See".into())]);
        let done = t.on_frame(&frame("[DONE]"));
        assert_eq!(done.len(), 2);
        match &done[0] {
            StreamEvent::Citations(items) => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].title, "A");
            }
            other => panic!("unexpected: {:?}", other),
        }
        match &done[1] {
            StreamEvent::Done {
                usage,
                web_search_used,
            } => {
                assert!(*web_search_used);
                assert_eq!(usage.web_search_requests, Some(1));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_truncated_stream_is_error() {
        let mut t = ChatCompletionsTranslator::new(false);
        t.on_frame(&frame(r#"{"choices":[{"delta":{"content":"partial"}}]}"#));
        let end = t.on_end();
        assert_eq!(end.len(), 1);
        assert!(matches!(end[0], StreamEvent::Error(_)));
    }

    #[test]
    fn test_error_chunk_is_terminal() {
        let mut t = ChatCompletionsTranslator::new(false);
        let events = t.on_frame(&frame(r#"{"error":{"message":"overloaded"}}"#));
        assert_eq!(
            events,
            vec![StreamEvent::Error("openai stream error: overloaded".into())]
        );
        assert!(t.on_frame(&frame("[DONE]")).is_empty());
        assert!(t.on_end().is_empty());
    }
}
