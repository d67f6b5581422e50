//! Chat History Module
//!
//! Record types and the storage trait behind the persistence gateway. Captures
//! conversations, branched sub-conversations, messages with their routing, token and
//! cost details, and per-request routing and api-call logs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Citation, TokenUsage};
use crate::protocol::LatencyBreakdown;

#[derive(Error, Debug)]
pub enum ChatHistoryError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ChatHistoryError>;

/// Privacy level for message content storage
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyLevel {
    /// Store only metadata, no content
    Off,
    /// Store a truncated summary
    Summary,
    /// Store full content
    #[default]
    Full,
}

impl PrivacyLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Some(PrivacyLevel::Off),
            "summary" => Some(PrivacyLevel::Summary),
            "full" => Some(PrivacyLevel::Full),
            _ => None,
        }
    }
}

/// Conversation metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub conversation_id: String,
    pub created_at: u64,
    pub last_seen_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Conversation {
    pub fn new(conversation_id: String) -> Self {
        let now = current_timestamp();
        Self {
            conversation_id,
            created_at: now,
            last_seen_at: now,
            title: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn touch(&mut self) {
        self.last_seen_at = current_timestamp();
    }
}

/// A branch of a conversation starting after `parent_message_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubConversation {
    pub sub_conversation_id: String,
    pub conversation_id: String,
    pub parent_message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created_at: u64,
}

impl SubConversation {
    pub fn new(conversation_id: String, parent_message_id: String) -> Self {
        Self {
            sub_conversation_id: format!("sub_{}", Uuid::new_v4().simple()),
            conversation_id,
            parent_message_id,
            title: None,
            created_at: current_timestamp(),
        }
    }
}

/// Enforce the parent-reference invariant: the parent message must exist and belong
/// to the same conversation.
pub fn validate_sub_conversation(sub: &SubConversation, parent: Option<&Message>) -> Result<()> {
    match parent {
        Some(message) if message.conversation_id == sub.conversation_id => Ok(()),
        Some(_) => Err(ChatHistoryError::InvalidInput(format!(
            "parent message {} belongs to another conversation",
            sub.parent_message_id
        ))),
        None => Err(ChatHistoryError::InvalidInput(format!(
            "parent message {} does not exist",
            sub.parent_message_id
        ))),
    }
}

/// Message role
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Model and routing information for an assistant message
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RoutingInfo {
    /// Model that produced the message
    pub model: Option<String>,
    /// Vendor of that model
    pub vendor: Option<String>,
    /// Backup chain at routing time
    #[serde(default)]
    pub backups: Vec<String>,
    #[serde(default)]
    pub is_manual_override: bool,
    /// Whether a backup produced the message
    #[serde(default)]
    pub fallback_used: bool,
}

/// Reasoning and sources attached to an assistant message
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ExtendedContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
}

impl ExtendedContent {
    pub fn is_empty(&self) -> bool {
        self.thinking.is_none() && self.citations.is_empty()
    }
}

/// A single message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub message_id: String,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_conversation_id: Option<String>,
    pub role: MessageRole,
    pub content: String,
    pub created_at: u64,

    // Routing information
    #[serde(flatten)]
    pub routing: RoutingInfo,

    // Token usage, cost and timings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencyBreakdown>,

    #[serde(default, skip_serializing_if = "ExtendedContent::is_empty")]
    pub extended: ExtendedContent,

    // Metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub privacy_level: PrivacyLevel,
}

impl Message {
    pub fn new(
        conversation_id: String,
        role: MessageRole,
        content: &str,
        privacy_level: PrivacyLevel,
    ) -> Self {
        let content_hash = Some(calculate_content_hash(content));
        let content = match privacy_level {
            PrivacyLevel::Off => String::new(),
            PrivacyLevel::Summary => generate_content_summary(content),
            PrivacyLevel::Full => content.to_string(),
        };

        Self {
            message_id: format!("msg_{}", Uuid::new_v4().simple()),
            conversation_id,
            sub_conversation_id: None,
            role,
            content,
            created_at: current_timestamp(),
            routing: RoutingInfo::default(),
            usage: None,
            cost_usd: None,
            latency: None,
            extended: ExtendedContent::default(),
            content_hash,
            privacy_level,
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn with_sub_conversation(mut self, sub_conversation_id: Option<String>) -> Self {
        self.sub_conversation_id = sub_conversation_id;
        self
    }

    pub fn with_routing(mut self, routing: RoutingInfo) -> Self {
        self.routing = routing;
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = Some(cost_usd);
        self
    }

    pub fn with_latency(mut self, latency: LatencyBreakdown) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_extended(mut self, extended: ExtendedContent) -> Self {
        self.extended = extended;
        self
    }
}

/// Routing decision as recorded for a request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingLog {
    pub log_id: String,
    pub conversation_id: String,
    /// User message that triggered the routing
    pub message_id: String,
    pub primary_model: String,
    pub primary_vendor: String,
    #[serde(default)]
    pub backups: Vec<String>,
    pub is_manual_override: bool,
    pub confidence: f64,
    #[serde(default)]
    pub analysis: String,
    /// SHA-256 fingerprint of the prompt
    pub prompt_fingerprint: String,
    pub created_at: u64,
}

/// Whether an api call was the routed primary or a fallback.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttemptKind {
    Primary,
    Backup,
}

/// One vendor call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiCallLog {
    pub log_id: String,
    pub conversation_id: String,
    pub model: String,
    pub vendor: String,
    pub attempt: AttemptKind,
    pub success: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: u64,
}

/// Generate a log identifier
pub fn new_log_id() -> String {
    format!("log_{}", Uuid::new_v4().simple())
}

/// Query filters for conversations
#[derive(Debug, Clone, Default)]
pub struct ConversationFilters {
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    pub limit: Option<usize>,
}

/// Query filters for messages
#[derive(Debug, Clone, Default)]
pub struct MessageFilters {
    pub conversation_id: Option<String>,
    pub sub_conversation_id: Option<String>,
    pub role: Option<MessageRole>,
    pub model: Option<String>,
    pub vendor: Option<String>,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    pub limit: Option<usize>,
}

impl MessageFilters {
    pub fn for_conversation(conversation_id: &str) -> Self {
        Self {
            conversation_id: Some(conversation_id.to_string()),
            ..Default::default()
        }
    }

    /// Shared predicate for in-process stores.
    pub fn matches(&self, message: &Message) -> bool {
        if let Some(ref id) = self.conversation_id {
            if &message.conversation_id != id {
                return false;
            }
        }
        if let Some(ref id) = self.sub_conversation_id {
            if message.sub_conversation_id.as_ref() != Some(id) {
                return false;
            }
        }
        if let Some(role) = self.role {
            if message.role != role {
                return false;
            }
        }
        if let Some(ref model) = self.model {
            if message.routing.model.as_ref() != Some(model) {
                return false;
            }
        }
        if let Some(ref vendor) = self.vendor {
            if message.routing.vendor.as_ref() != Some(vendor) {
                return false;
            }
        }
        if let Some(start) = self.start_time {
            if message.created_at < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if message.created_at > end {
                return false;
            }
        }
        true
    }
}

/// Storage statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStats {
    pub total_conversations: usize,
    pub total_sub_conversations: usize,
    pub total_messages: usize,
    pub total_routing_logs: usize,
    pub total_api_calls: usize,
    pub backend_type: String,
    pub storage_path: Option<String>,
}

/// Chat history storage trait
#[async_trait::async_trait]
pub trait ChatHistoryStore: Send + Sync {
    /// Initialize the storage backend
    async fn init(&self) -> Result<()>;

    /// Insert or replace a conversation
    async fn record_conversation(&self, conversation: &Conversation) -> Result<()>;

    /// Get a conversation by ID
    async fn get_conversation(&self, conversation_id: &str) -> Result<Conversation>;

    /// Update an existing conversation
    async fn update_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.get_conversation(&conversation.conversation_id).await?;
        self.record_conversation(conversation).await
    }

    /// List conversations with filters, most recently seen first
    async fn list_conversations(&self, filters: &ConversationFilters) -> Result<Vec<Conversation>>;

    /// Insert a sub-conversation; fails with `InvalidInput` if the parent reference
    /// is broken
    async fn record_sub_conversation(&self, sub: &SubConversation) -> Result<()>;

    async fn get_sub_conversation(&self, sub_conversation_id: &str) -> Result<SubConversation>;

    async fn list_sub_conversations(&self, conversation_id: &str) -> Result<Vec<SubConversation>>;

    /// Record a message
    async fn record_message(&self, message: &Message) -> Result<()>;

    /// Record multiple messages in a batch
    async fn record_messages(&self, messages: &[Message]) -> Result<()> {
        for message in messages {
            self.record_message(message).await?;
        }
        Ok(())
    }

    async fn get_message(&self, message_id: &str) -> Result<Message>;

    /// Replace an existing message
    async fn update_message(&self, message: &Message) -> Result<()>;

    /// List messages with filters, oldest first
    async fn list_messages(&self, filters: &MessageFilters) -> Result<Vec<Message>>;

    async fn record_routing_log(&self, log: &RoutingLog) -> Result<()>;

    async fn list_routing_logs(&self, conversation_id: &str) -> Result<Vec<RoutingLog>>;

    async fn record_api_call(&self, log: &ApiCallLog) -> Result<()>;

    async fn list_api_calls(&self, conversation_id: &str) -> Result<Vec<ApiCallLog>>;

    /// Delete a conversation and everything that references it
    async fn delete_conversation(&self, conversation_id: &str) -> Result<()>;

    /// Clear all data (admin only)
    async fn clear(&self) -> Result<()>;

    /// Get storage statistics
    async fn stats(&self) -> Result<StorageStats>;

    /// Health check
    async fn health(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Multi-backend composite store. Reads go to the primary; writes go to the primary
/// and then to every sink.
pub struct CompositeStore {
    primary: Box<dyn ChatHistoryStore>,
    sinks: Vec<Box<dyn ChatHistoryStore>>,
    strict: bool,
}

impl CompositeStore {
    pub fn new(primary: Box<dyn ChatHistoryStore>, strict: bool) -> Self {
        Self {
            primary,
            sinks: Vec::new(),
            strict,
        }
    }

    pub fn add_sink(&mut self, sink: Box<dyn ChatHistoryStore>) {
        self.sinks.push(sink);
    }
}

/// Write to the primary, then fan out to sinks. Sink failures are fatal only in
/// strict mode.
macro_rules! fan_out {
    ($self:ident, $method:ident ( $($arg:expr),* )) => {{
        $self.primary.$method($($arg),*).await?;
        for sink in &$self.sinks {
            if let Err(e) = sink.$method($($arg),*).await {
                if $self.strict {
                    return Err(e);
                }
                tracing::warn!("Sink {} failed: {}", stringify!($method), e);
            }
        }
        Ok(())
    }};
}

#[async_trait::async_trait]
impl ChatHistoryStore for CompositeStore {
    async fn init(&self) -> Result<()> {
        fan_out!(self, init())
    }

    async fn record_conversation(&self, conversation: &Conversation) -> Result<()> {
        fan_out!(self, record_conversation(conversation))
    }

    async fn get_conversation(&self, conversation_id: &str) -> Result<Conversation> {
        self.primary.get_conversation(conversation_id).await
    }

    async fn update_conversation(&self, conversation: &Conversation) -> Result<()> {
        fan_out!(self, update_conversation(conversation))
    }

    async fn list_conversations(&self, filters: &ConversationFilters) -> Result<Vec<Conversation>> {
        self.primary.list_conversations(filters).await
    }

    async fn record_sub_conversation(&self, sub: &SubConversation) -> Result<()> {
        fan_out!(self, record_sub_conversation(sub))
    }

    async fn get_sub_conversation(&self, sub_conversation_id: &str) -> Result<SubConversation> {
        self.primary.get_sub_conversation(sub_conversation_id).await
    }

    async fn list_sub_conversations(&self, conversation_id: &str) -> Result<Vec<SubConversation>> {
        self.primary.list_sub_conversations(conversation_id).await
    }

    async fn record_message(&self, message: &Message) -> Result<()> {
        fan_out!(self, record_message(message))
    }

    async fn record_messages(&self, messages: &[Message]) -> Result<()> {
        fan_out!(self, record_messages(messages))
    }

    async fn get_message(&self, message_id: &str) -> Result<Message> {
        self.primary.get_message(message_id).await
    }

    async fn update_message(&self, message: &Message) -> Result<()> {
        fan_out!(self, update_message(message))
    }

    async fn list_messages(&self, filters: &MessageFilters) -> Result<Vec<Message>> {
        self.primary.list_messages(filters).await
    }

    async fn record_routing_log(&self, log: &RoutingLog) -> Result<()> {
        fan_out!(self, record_routing_log(log))
    }

    async fn list_routing_logs(&self, conversation_id: &str) -> Result<Vec<RoutingLog>> {
        self.primary.list_routing_logs(conversation_id).await
    }

    async fn record_api_call(&self, log: &ApiCallLog) -> Result<()> {
        fan_out!(self, record_api_call(log))
    }

    async fn list_api_calls(&self, conversation_id: &str) -> Result<Vec<ApiCallLog>> {
        self.primary.list_api_calls(conversation_id).await
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        fan_out!(self, delete_conversation(conversation_id))
    }

    async fn clear(&self) -> Result<()> {
        fan_out!(self, clear())
    }

    async fn stats(&self) -> Result<StorageStats> {
        self.primary.stats().await
    }

    async fn health(&self) -> Result<bool> {
        let primary_ok = self.primary.health().await?;
        if !primary_ok {
            return Ok(false);
        }
        // Sinks don't affect health in non-strict mode
        if self.strict {
            for sink in &self.sinks {
                if !sink.health().await? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

// Helper functions

static LAST_TIMESTAMP: AtomicU64 = AtomicU64::new(0);

/// Milliseconds since the epoch, strictly increasing within the process.
pub fn current_timestamp() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let mut last = LAST_TIMESTAMP.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_TIMESTAMP.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(observed) => last = observed,
        }
    }
}

/// SHA-256 of the original content, hex encoded
pub fn calculate_content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

fn generate_content_summary(content: &str) -> String {
    const LIMIT: usize = 100;
    if content.chars().count() > LIMIT {
        let truncated: String = content.chars().take(LIMIT).collect();
        format!("{}...", truncated)
    } else {
        content.to_string()
    }
}
