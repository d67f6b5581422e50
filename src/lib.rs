#![forbid(unsafe_code)]
#![doc = r#"
Modelrelay

Route a chat message to one of several AI model vendors and relay the vendor's token
stream to the client over a single NDJSON event protocol, falling back to a backup
model when the first choice fails.

Crate highlights
- Uniform stream events (`models::StreamEvent`) produced by one adapter per vendor.
- Deterministic primary/backup selection from an oracle recommendation (`routing`).
- A single-retry stream orchestrator (`orchestrator`) and per-request flow (`chat_service`).
- Cost accounting (`pricing`) and a pluggable record store (`chat_history*`).
- HTTP server (in `server`): `/v1/chat` plus thin listing endpoints.

Modules
- `provider*`: adapter trait, SSE helpers, OpenAI/Anthropic/Gemini/Bedrock adapters, registry.
- `router_client`: recommendation oracle clients (HTTP and embedded catalog).
- `protocol`: outward record types and error codes.
- `util`: tracing, env, HTTP client and CORS helpers.
"#]

pub mod chat_history;
pub mod chat_history_jsonl;
pub mod chat_history_manager;
pub mod chat_history_memory;
pub mod chat_service;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod pricing;
pub mod protocol;
pub mod provider;
pub mod provider_anthropic;
pub mod provider_bedrock;
pub mod provider_gemini;
pub mod provider_openai;
pub mod provider_registry;
pub mod router_client;
pub mod routing;
pub mod server;
pub mod util;

pub use crate::chat_history_manager::{ChatHistoryConfig, ChatHistoryManager};
pub use crate::chat_service::{ChatRequest, ChatService, RelayConfig};
pub use crate::error::RelayError;
pub use crate::models::{Citation, GenerationRequest, StreamEvent, TokenUsage};
pub use crate::pricing::PricingConfig;
pub use crate::protocol::{ErrorCode, OutboundEvent};
pub use crate::provider::{ProviderAdapter, ProviderError, Vendor};
pub use crate::provider_registry::{ProviderRegistry, ProviderSource};
pub use crate::router_client::{
    HttpRouterClient, HttpRouterConfig, LocalPolicyRouter, Recommendation, RouteError,
    RouterClient,
};
pub use crate::routing::{RouteResolver, RoutingDecision};
