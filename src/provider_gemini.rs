//! Google Gemini adapter (`streamGenerateContent?alt=sse`).
//!
//! Roles map `assistant -> model`; system turns and the system prompt are merged into
//! `systemInstruction`. Each SSE frame carries a full `GenerateContentResponse` slice.

use serde_json::{json, Value};

use crate::models::{Citation, GenerationRequest, StreamEvent, TokenUsage, ToolActivity, TurnRole};
use crate::provider::{
    drive_sse, join_url, CitationCollector, EventStream, ProviderAdapter, SseFrame,
    SseTranslator, Vendor,
};

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiAdapter {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GeminiAdapter {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

impl ProviderAdapter for GeminiAdapter {
    fn vendor(&self) -> Vendor {
        Vendor::Google
    }

    fn stream(&self, request: GenerationRequest) -> EventStream {
        let path = format!("models/{}:streamGenerateContent?alt=sse", request.model_id);
        let url = join_url(&self.base_url, &path);
        let body = build_body(&request);
        tracing::debug!(model = %request.model_id, "gemini streamGenerateContent request");
        let builder = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body);
        drive_sse(Vendor::Google, builder, GeminiTranslator::new())
    }
}

fn supports_thinking(model: &str) -> bool {
    model.contains("gemini-2.5")
}

fn supports_search(model: &str) -> bool {
    model.starts_with("gemini-2")
}

pub(crate) fn build_body(request: &GenerationRequest) -> Value {
    let mut system_parts: Vec<&str> = Vec::new();
    if !request.system_prompt.trim().is_empty() {
        system_parts.push(&request.system_prompt);
    }
    let mut contents = Vec::with_capacity(request.turns.len());
    for turn in &request.turns {
        let role = match turn.role {
            TurnRole::System => {
                system_parts.push(&turn.content);
                continue;
            }
            TurnRole::User => "user",
            TurnRole::Assistant => "model",
        };
        contents.push(json!({"role": role, "parts": [{"text": turn.content}]}));
    }

    let mut body = json!({ "contents": contents });
    if !system_parts.is_empty() {
        body["systemInstruction"] = json!({"parts": [{"text": system_parts.join("\n\n")}]});
    }
    if request.enable_thinking && supports_thinking(&request.model_id) {
        body["generationConfig"] = json!({"thinkingConfig": {"includeThoughts": true}});
    }
    if request.enable_web_search && supports_search(&request.model_id) {
        body["tools"] = json!([{"google_search": {}}]);
    }
    body
}

pub(crate) struct GeminiTranslator {
    citations: CitationCollector,
    usage: TokenUsage,
    grounded: bool,
    received: bool,
    finished: bool,
}

impl GeminiTranslator {
    pub(crate) fn new() -> Self {
        Self {
            citations: CitationCollector::new(),
            usage: TokenUsage::default(),
            grounded: false,
            received: false,
            finished: false,
        }
    }

    fn complete(&mut self) -> Vec<StreamEvent> {
        self.finished = true;
        let web_search_used = !self.citations.is_empty() || self.grounded;
        if self.grounded {
            self.usage.web_search_requests = Some(1);
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

    fn on_grounding(&mut self, metadata: &Value, out: &mut Vec<StreamEvent>) {
        let queries = metadata["webSearchQueries"]
            .as_array()
            .map(|q| !q.is_empty())
            .unwrap_or(false);
        if queries && !self.grounded {
            self.grounded = true;
            out.push(StreamEvent::ToolUse(ToolActivity::new("google_search", "completed")));
        }

        let chunks = match metadata["groundingChunks"].as_array() {
            Some(c) => c,
            None => return,
        };
        let supports = metadata["groundingSupports"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        for (index, chunk) in chunks.iter().enumerate() {
            let web = &chunk["web"];
            let url = match web["uri"].as_str() {
                Some(u) => u,
                None => continue,
            };
            let snippet = supports
                .iter()
                .find(|s| {
                    s["groundingChunkIndices"]
                        .as_array()
                        .map(|ix| ix.iter().any(|i| i.as_u64() == Some(index as u64)))
                        .unwrap_or(false)
                })
                .and_then(|s| s.pointer("/segment/text"))
                .and_then(|t| t.as_str())
                .map(str::to_string);
            self.citations.add(Citation {
                url: url.to_string(),
                title: web["title"].as_str().unwrap_or_default().to_string(),
                snippet,
            });
        }
    }

    fn on_chunk(&mut self, chunk: &Value) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if let Some(message) = chunk.pointer("/error/message").and_then(|m| m.as_str()) {
            self.finished = true;
            out.push(StreamEvent::Error(format!("google stream error: {}", message)));
            return out;
        }
        if let Some(reason) = chunk
            .pointer("/promptFeedback/blockReason")
            .and_then(|r| r.as_str())
        {
            self.finished = true;
            out.push(StreamEvent::Error(format!("google blocked the prompt: {}", reason)));
            return out;
        }
        self.received = true;

        if let Some(candidate) = chunk["candidates"].get(0) {
            if let Some(parts) = candidate.pointer("/content/parts").and_then(|p| p.as_array()) {
                for part in parts {
                    let text = match part["text"].as_str() {
                        Some(t) if !t.is_empty() => t.to_string(),
                        _ => continue,
                    };
                    if part["thought"].as_bool().unwrap_or(false) {
                        out.push(StreamEvent::Thinking(text));
                    } else {
                        out.push(StreamEvent::Delta(text));
                    }
                }
            }
            if let Some(metadata) = candidate.get("groundingMetadata") {
                self.on_grounding(metadata, &mut out);
            }
        }

        if let Some(meta) = chunk.get("usageMetadata") {
            self.usage.input_tokens = meta["promptTokenCount"].as_u64().unwrap_or(0);
            self.usage.output_tokens = meta["candidatesTokenCount"].as_u64().unwrap_or(0);
            self.usage.reasoning_tokens = meta["thoughtsTokenCount"].as_u64().unwrap_or(0);
            self.usage.cached_tokens = meta["cachedContentTokenCount"].as_u64().unwrap_or(0);
        }
        out
    }
}

impl SseTranslator for GeminiTranslator {
    fn on_frame(&mut self, frame: &SseFrame) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        match serde_json::from_str::<Value>(&frame.data) {
            Ok(chunk) => self.on_chunk(&chunk),
            Err(e) => {
                tracing::debug!("Skipping unparseable gemini frame: {}", e);
                Vec::new()
            }
        }
    }

    /// Gemini has no end marker; a body that produced at least one response completes.
    fn on_end(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        if self.received {
            return self.complete();
        }
        self.finished = true;
        vec![StreamEvent::Error("google returned an empty stream".to_string())]
    }
}
