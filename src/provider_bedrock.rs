//! AWS Bedrock adapter
//!
//! Uses the AWS SDK (`invoke_model_with_response_stream`), so SigV4 signing and the
//! credential chain (`AWS_ACCESS_KEY_ID`, `AWS_PROFILE`, ...) are handled by the SDK.
//! Anthropic models on Bedrock stream the same event objects as the direct Messages
//! API and reuse its translator; Meta, Mistral and Titan stream plain text chunks.

use std::sync::Arc;

use async_stream::stream;
use serde_json::{json, Value};
use tokio::sync::OnceCell;

use crate::models::{GenerationRequest, StreamEvent, TokenUsage, TurnRole};
use crate::provider::{EventStream, ProviderAdapter, Vendor};
use crate::provider_anthropic::{build_messages_body, MessagesTranslator};

pub const BEDROCK_ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";
const TEXT_MAX_TOKENS: u64 = 2048;
const METRICS_KEY: &str = "amazon-bedrock-invocationMetrics";

/// Bedrock model families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BedrockFamily {
    Anthropic,
    AmazonTitan,
    Meta,
    Mistral,
    Cohere,
    AI21,
}

impl BedrockFamily {
    /// Detect the family from a model ID (optionally carrying a region prefix such
    /// as `us.anthropic.claude-...`).
    pub fn from_model_id(model_id: &str) -> Option<Self> {
        let id = ["us.", "eu.", "apac."]
            .iter()
            .find_map(|p| model_id.strip_prefix(p))
            .unwrap_or(model_id);
        if id.starts_with("anthropic.") {
            Some(BedrockFamily::Anthropic)
        } else if id.starts_with("amazon.titan") {
            Some(BedrockFamily::AmazonTitan)
        } else if id.starts_with("meta.") {
            Some(BedrockFamily::Meta)
        } else if id.starts_with("mistral.") {
            Some(BedrockFamily::Mistral)
        } else if id.starts_with("cohere.") {
            Some(BedrockFamily::Cohere)
        } else if id.starts_with("ai21.") {
            Some(BedrockFamily::AI21)
        } else {
            None
        }
    }
}

/// Build the InvokeModel body for a family.
pub(crate) fn build_body(request: &GenerationRequest, family: BedrockFamily) -> Result<Value, String> {
    match family {
        BedrockFamily::Anthropic => {
            let mut body = build_messages_body(request);
            body["anthropic_version"] = json!(BEDROCK_ANTHROPIC_VERSION);
            // Server-side web search is not offered on Bedrock.
            if let Some(obj) = body.as_object_mut() {
                obj.remove("tools");
            }
            Ok(body)
        }
        BedrockFamily::AmazonTitan => {
            let mut prompt = String::new();
            if !request.system_prompt.trim().is_empty() {
                prompt.push_str(&format!("System: {}\n", request.system_prompt));
            }
            for turn in &request.turns {
                let prefix = match turn.role {
                    TurnRole::System => "System: ",
                    TurnRole::User => "User: ",
                    TurnRole::Assistant => "Assistant: ",
                };
                prompt.push_str(prefix);
                prompt.push_str(&turn.content);
                prompt.push('\n');
            }
            prompt.push_str("Assistant: ");
            Ok(json!({
                "inputText": prompt,
                "textGenerationConfig": {"maxTokenCount": TEXT_MAX_TOKENS},
            }))
        }
        BedrockFamily::Meta => {
            let mut prompt = String::from("<|begin_of_text|>");
            let mut push = |role: &str, content: &str| {
                prompt.push_str(&format!(
                    "<|start_header_id|>{}<|end_header_id|>\n\n{}<|eot_id|>",
                    role, content
                ));
            };
            if !request.system_prompt.trim().is_empty() {
                push("system", &request.system_prompt);
            }
            for turn in &request.turns {
                let role = match turn.role {
                    TurnRole::System => "system",
                    TurnRole::User => "user",
                    TurnRole::Assistant => "assistant",
                };
                push(role, &turn.content);
            }
            prompt.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
            Ok(json!({"prompt": prompt, "max_gen_len": TEXT_MAX_TOKENS}))
        }
        BedrockFamily::Mistral => {
            let mut prompt = String::from("<s>");
            let mut pending_system = request.system_prompt.trim().to_string();
            for turn in &request.turns {
                match turn.role {
                    TurnRole::System => {
                        if !pending_system.is_empty() {
                            pending_system.push('\n');
                        }
                        pending_system.push_str(&turn.content);
                    }
                    TurnRole::User => {
                        let content = if pending_system.is_empty() {
                            turn.content.clone()
                        } else {
                            format!("{}\n\n{}", std::mem::take(&mut pending_system), turn.content)
                        };
                        prompt.push_str(&format!("[INST] {} [/INST]", content));
                    }
                    TurnRole::Assistant => {
                        prompt.push_str(&format!(" {}</s>", turn.content));
                    }
                }
            }
            Ok(json!({"prompt": prompt, "max_tokens": TEXT_MAX_TOKENS}))
        }
        BedrockFamily::Cohere | BedrockFamily::AI21 => Err(format!(
            "bedrock streaming is not supported for {}",
            request.model_id
        )),
    }
}

/// Token counts reported on the final chunk of every Bedrock stream.
fn invocation_metrics(chunk: &Value) -> Option<(u64, u64)> {
    let metrics = chunk.get(METRICS_KEY)?;
    Some((
        metrics["inputTokenCount"].as_u64().unwrap_or(0),
        metrics["outputTokenCount"].as_u64().unwrap_or(0),
    ))
}

pub(crate) enum BedrockTranslator {
    Anthropic(MessagesTranslator),
    Text {
        family: BedrockFamily,
        usage: TokenUsage,
        stop_seen: bool,
        finished: bool,
    },
}

impl BedrockTranslator {
    pub(crate) fn new(family: BedrockFamily) -> Self {
        match family {
            BedrockFamily::Anthropic => BedrockTranslator::Anthropic(MessagesTranslator::new()),
            other => BedrockTranslator::Text {
                family: other,
                usage: TokenUsage::default(),
                stop_seen: false,
                finished: false,
            },
        }
    }

    pub(crate) fn on_chunk(&mut self, chunk: &Value) -> Vec<StreamEvent> {
        let metrics = invocation_metrics(chunk);
        match self {
            BedrockTranslator::Anthropic(inner) => {
                if let Some((input, output)) = metrics {
                    inner.set_token_counts(input, output);
                }
                inner.on_event(chunk)
            }
            BedrockTranslator::Text {
                family,
                usage,
                stop_seen,
                finished,
            } => {
                if *finished {
                    return Vec::new();
                }
                let (text, stop) = match family {
                    BedrockFamily::AmazonTitan => (
                        chunk["outputText"].as_str(),
                        !chunk["completionReason"].is_null(),
                    ),
                    BedrockFamily::Meta => (
                        chunk["generation"].as_str(),
                        !chunk["stop_reason"].is_null(),
                    ),
                    _ => (
                        chunk.pointer("/outputs/0/text").and_then(|t| t.as_str()),
                        chunk
                            .pointer("/outputs/0/stop_reason")
                            .map(|s| !s.is_null())
                            .unwrap_or(false),
                    ),
                };
                let mut out = Vec::new();
                if let Some(text) = text.filter(|t| !t.is_empty()) {
                    out.push(StreamEvent::Delta(text.to_string()));
                }
                *stop_seen |= stop;
                if let Some((input, output)) = metrics {
                    usage.input_tokens = input;
                    usage.output_tokens = output;
                    *finished = true;
                    out.push(StreamEvent::Done {
                        usage: *usage,
                        web_search_used: false,
                    });
                }
                out
            }
        }
    }

    pub(crate) fn on_end(&mut self) -> Vec<StreamEvent> {
        match self {
            BedrockTranslator::Anthropic(inner) => {
                if inner.is_finished() {
                    Vec::new()
                } else {
                    inner.fail("bedrock stream ended before message_stop".to_string())
                }
            }
            BedrockTranslator::Text {
                usage,
                stop_seen,
                finished,
                ..
            } => {
                if *finished {
                    return Vec::new();
                }
                *finished = true;
                if *stop_seen {
                    vec![StreamEvent::Done {
                        usage: *usage,
                        web_search_used: false,
                    }]
                } else {
                    vec![StreamEvent::Error(
                        "bedrock stream ended before completion".to_string(),
                    )]
                }
            }
        }
    }
}

/// Bedrock adapter. The SDK client is built once, on first use.
pub struct BedrockAdapter {
    region: String,
    client: Arc<OnceCell<aws_sdk_bedrockruntime::Client>>,
}

impl BedrockAdapter {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            client: Arc::new(OnceCell::new()),
        }
    }

    /// Region from `AWS_REGION` / `AWS_DEFAULT_REGION`, defaulting to us-east-1.
    pub fn region_from_env() -> String {
        std::env::var("AWS_REGION")
            .or_else(|_| std::env::var("AWS_DEFAULT_REGION"))
            .ok()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "us-east-1".to_string())
    }
}

async fn sdk_client(region: String) -> aws_sdk_bedrockruntime::Client {
    use aws_config::BehaviorVersion;
    use aws_sdk_bedrockruntime::config::Region;

    let sdk_config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region))
        .load()
        .await;
    aws_sdk_bedrockruntime::Client::new(&sdk_config)
}

impl ProviderAdapter for BedrockAdapter {
    fn vendor(&self) -> Vendor {
        Vendor::Bedrock
    }

    fn stream(&self, request: GenerationRequest) -> EventStream {
        use aws_sdk_bedrockruntime::error::DisplayErrorContext;
        use aws_sdk_bedrockruntime::primitives::Blob;
        use aws_sdk_bedrockruntime::types::ResponseStream;

        let region = self.region.clone();
        let cell = self.client.clone();
        Box::pin(stream! {
            let family = match BedrockFamily::from_model_id(&request.model_id) {
                Some(f) => f,
                None => {
                    yield StreamEvent::Error(format!("Unknown Bedrock model family: {}", request.model_id));
                    return;
                }
            };
            let body = match build_body(&request, family) {
                Ok(b) => b,
                Err(msg) => {
                    yield StreamEvent::Error(msg);
                    return;
                }
            };
            let body_bytes = match serde_json::to_vec(&body) {
                Ok(b) => b,
                Err(e) => {
                    yield StreamEvent::Error(format!("bedrock body encoding failed: {}", e));
                    return;
                }
            };

            let client = cell.get_or_init(|| sdk_client(region)).await.clone();
            tracing::debug!(model = %request.model_id, "bedrock invoke_model_with_response_stream");
            let response = client
                .invoke_model_with_response_stream()
                .model_id(&request.model_id)
                .content_type("application/json")
                .body(Blob::new(body_bytes))
                .send()
                .await;
            let mut events = match response {
                Ok(r) => r.body,
                Err(e) => {
                    yield StreamEvent::Error(format!("Bedrock streaming invocation failed: {}", DisplayErrorContext(&e)));
                    return;
                }
            };

            let mut translator = BedrockTranslator::new(family);
            loop {
                match events.recv().await {
                    Ok(Some(ResponseStream::Chunk(part))) => {
                        let chunk = part
                            .bytes()
                            .and_then(|b| serde_json::from_slice::<Value>(b.as_ref()).ok());
                        if let Some(chunk) = chunk {
                            for event in translator.on_chunk(&chunk) {
                                let terminal = event.is_terminal();
                                yield event;
                                if terminal {
                                    return;
                                }
                            }
                        }
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(e) => {
                        yield StreamEvent::Error(format!("Bedrock stream error: {}", DisplayErrorContext(&e)));
                        return;
                    }
                }
            }
            for event in translator.on_end() {
                yield event;
            }
        })
    }
}
