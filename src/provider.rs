//! Provider adapter seam.
//!
//! Each vendor backend implements [`ProviderAdapter`] and translates its native
//! streaming wire format into [`StreamEvent`]s. Helpers shared by the HTTP based
//! adapters (SSE framing, citation collection, error bodies) live here.

use std::collections::HashSet;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;

use async_stream::stream;
use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::models::{Citation, GenerationRequest, StreamEvent};

/// Lazy, single-pass stream of uniform events produced by one attempt.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Supported backend vendors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    OpenAi,
    Anthropic,
    Google,
    Bedrock,
}

impl Vendor {
    pub const ALL: [Vendor; 4] = [
        Vendor::OpenAi,
        Vendor::Anthropic,
        Vendor::Google,
        Vendor::Bedrock,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Vendor::OpenAi => "openai",
            Vendor::Anthropic => "anthropic",
            Vendor::Google => "google",
            Vendor::Bedrock => "bedrock",
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Vendor {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Vendor::OpenAi),
            "anthropic" => Ok(Vendor::Anthropic),
            "google" | "gemini" => Ok(Vendor::Google),
            "bedrock" | "aws" => Ok(Vendor::Bedrock),
            _ => Err(ProviderError::UnsupportedVendor(s.to_string())),
        }
    }
}

/// Adapter construction errors. Stream-level failures are reported as
/// `StreamEvent::Error` instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("Unsupported vendor: {0}")]
    UnsupportedVendor(String),

    #[error("Missing credential for {0}")]
    MissingCredential(String),
}

/// One vendor backend.
pub trait ProviderAdapter: Send + Sync {
    fn vendor(&self) -> Vendor;

    /// Start a generation. Nothing is sent upstream until the stream is polled.
    fn stream(&self, request: GenerationRequest) -> EventStream;
}

/// One decoded server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn is_done_marker(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Incremental SSE decoder. Frames are separated by a blank line; `data:` lines of a
/// frame are joined with `\n`. Comment and unknown lines are ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend(chunk.iter().copied().filter(|&b| b != b'\r'));
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.windows(2).position(|window| window == b"\n\n") {
            let raw: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            if let Some(frame) = parse_frame(&raw[..pos]) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush whatever is left once the body ends, even without a terminator.
    pub fn finish(&mut self) -> Option<SseFrame> {
        let remaining = std::mem::take(&mut self.buffer);
        parse_frame(&remaining)
    }
}

fn parse_frame(raw: &[u8]) -> Option<SseFrame> {
    let text = String::from_utf8_lossy(raw);
    let mut event = None;
    let mut data_segments: Vec<&str> = Vec::new();
    for line in text.split('\n') {
        if let Some(rest) = line.strip_prefix("data:") {
            data_segments.push(rest.strip_prefix(' ').unwrap_or(rest));
        } else if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        }
    }
    if data_segments.is_empty() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data_segments.join("\n"),
    })
}

/// Turn a streaming HTTP body into decoded SSE frames.
pub fn sse_frames(
    response: reqwest::Response,
) -> impl Stream<Item = Result<SseFrame, String>> + Send {
    stream! {
        let mut decoder = SseDecoder::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    for frame in decoder.push(&bytes) {
                        yield Ok(frame);
                    }
                }
                Err(e) => {
                    yield Err(format!("stream read failed: {}", e));
                    return;
                }
            }
        }
        if let Some(frame) = decoder.finish() {
            yield Ok(frame);
        }
    }
}

/// Vendor specific translation from SSE frames to uniform events.
pub trait SseTranslator: Send + 'static {
    fn on_frame(&mut self, frame: &SseFrame) -> Vec<StreamEvent>;

    /// Called when the body ends. Must produce a terminal event unless one was
    /// already returned from `on_frame`.
    fn on_end(&mut self) -> Vec<StreamEvent>;
}

/// Send `request`, then run the SSE body through `translator`. Guarantees exactly
/// one terminal event and nothing after it.
pub fn drive_sse<T: SseTranslator>(
    vendor: Vendor,
    request: reqwest::RequestBuilder,
    mut translator: T,
) -> EventStream {
    Box::pin(stream! {
        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                yield StreamEvent::Error(format!("{} request failed: {}", vendor, e));
                return;
            }
        };
        if !response.status().is_success() {
            yield StreamEvent::Error(upstream_error(vendor, response).await);
            return;
        }

        let frames = sse_frames(response);
        futures_util::pin_mut!(frames);
        while let Some(frame) = frames.next().await {
            let frame = match frame {
                Ok(f) => f,
                Err(msg) => {
                    yield StreamEvent::Error(format!("{} {}", vendor, msg));
                    return;
                }
            };
            for event in translator.on_frame(&frame) {
                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    return;
                }
            }
        }

        for event in translator.on_end() {
            let terminal = event.is_terminal();
            yield event;
            if terminal {
                return;
            }
        }
        yield StreamEvent::Error(format!("{} stream ended before completion", vendor));
    })
}

/// Read a non-success response into a short error message.
pub async fn upstream_error(vendor: Vendor, response: reqwest::Response) -> String {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown error".to_string());
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or(body);
    format!("{} returned {}: {}", vendor, status, message.trim())
}

/// Collects citations for one attempt, deduplicated by URL. The first snippet seen
/// for a URL wins; a later snippet only fills a missing one.
#[derive(Debug, Default)]
pub struct CitationCollector {
    seen: HashSet<String>,
    items: Vec<Citation>,
}

impl CitationCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, citation: Citation) {
        if citation.url.trim().is_empty() {
            return;
        }
        if self.seen.insert(citation.url.clone()) {
            self.items.push(citation);
        } else if let Some(existing) = self.items.iter_mut().find(|c| c.url == citation.url) {
            if existing.snippet.is_none() {
                existing.snippet = citation.snippet;
            }
            if existing.title.is_empty() {
                existing.title = citation.title;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drain into a single `Citations` event, if any were collected.
    pub fn take_event(&mut self) -> Option<StreamEvent> {
        if self.items.is_empty() {
            return None;
        }
        self.seen.clear();
        Some(StreamEvent::Citations(std::mem::take(&mut self.items)))
    }
}

/// Join a base URL and a path without doubling slashes.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
