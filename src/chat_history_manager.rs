//! Chat History Manager
//!
//! Persistence gateway in front of the configured record store. Builds the store from
//! configuration, applies the privacy level, and offers the per-exchange writes the
//! chat service needs.

use crate::chat_history::{
    ApiCallLog, ChatHistoryError, ChatHistoryStore, CompositeStore, Conversation,
    ConversationFilters, Message, MessageFilters, MessageRole, PrivacyLevel, Result, RoutingLog,
    StorageStats, SubConversation,
};
use crate::chat_history_jsonl::JsonlChatHistoryStore;
use crate::chat_history_memory::MemoryChatHistoryStore;

use std::sync::Arc;

/// Configuration for chat history
#[derive(Debug, Clone)]
pub struct ChatHistoryConfig {
    /// Whether writes are persisted at all
    pub enabled: bool,
    /// Primary storage backend ("memory" or "jsonl")
    pub primary_backend: String,
    /// Sink backends (best-effort unless strict)
    pub sink_backends: Vec<String>,
    /// Privacy level
    pub privacy_level: PrivacyLevel,
    /// Strict mode (sink failures fail the write)
    pub strict: bool,
    /// JSONL file path
    pub jsonl_path: Option<String>,
    /// Max messages for memory backend
    pub memory_max_messages: Option<usize>,
}

impl Default for ChatHistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            primary_backend: "memory".to_string(),
            sink_backends: Vec::new(),
            privacy_level: PrivacyLevel::Full,
            strict: false,
            jsonl_path: Some("./data/modelrelay_history.jsonl".to_string()),
            memory_max_messages: Some(10000),
        }
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

impl ChatHistoryConfig {
    /// Load configuration from `MODELRELAY_HISTORY_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let enabled = env_flag("MODELRELAY_HISTORY_ENABLED", defaults.enabled);

        let primary_backend = std::env::var("MODELRELAY_HISTORY_BACKEND")
            .ok()
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.primary_backend);

        let sink_backends: Vec<String> = std::env::var("MODELRELAY_HISTORY_SINKS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        let privacy_level = std::env::var("MODELRELAY_HISTORY_PRIVACY")
            .ok()
            .and_then(|s| PrivacyLevel::parse(&s))
            .unwrap_or(defaults.privacy_level);

        let strict = env_flag("MODELRELAY_HISTORY_STRICT", defaults.strict);

        let jsonl_path = std::env::var("MODELRELAY_HISTORY_JSONL_PATH")
            .ok()
            .or(defaults.jsonl_path);

        let memory_max_messages = std::env::var("MODELRELAY_HISTORY_MEMORY_MAX_MESSAGES")
            .ok()
            .and_then(|s| s.parse().ok())
            .or(defaults.memory_max_messages);

        Self {
            enabled,
            primary_backend,
            sink_backends,
            privacy_level,
            strict,
            jsonl_path,
            memory_max_messages,
        }
    }
}

/// Persistence gateway
pub struct ChatHistoryManager {
    store: Arc<dyn ChatHistoryStore>,
    config: ChatHistoryConfig,
}

impl ChatHistoryManager {
    /// Create a new chat history manager with the given configuration
    pub async fn new(config: ChatHistoryConfig) -> Result<Self> {
        let store = Self::create_store(&config)?;
        store.init().await?;
        tracing::info!(
            "Chat history: backend={} sinks={:?} privacy={:?} enabled={}",
            config.primary_backend,
            config.sink_backends,
            config.privacy_level,
            config.enabled
        );
        Ok(Self { store, config })
    }

    /// Wrap an existing store.
    pub fn with_store(store: Arc<dyn ChatHistoryStore>, config: ChatHistoryConfig) -> Self {
        Self { store, config }
    }

    /// In-memory store with default settings.
    pub fn in_memory() -> Self {
        Self::with_store(
            Arc::new(MemoryChatHistoryStore::new()),
            ChatHistoryConfig::default(),
        )
    }

    fn create_store(config: &ChatHistoryConfig) -> Result<Arc<dyn ChatHistoryStore>> {
        let primary = Self::create_backend(&config.primary_backend, config)?;

        if config.sink_backends.is_empty() {
            // Single backend
            Ok(Arc::from(primary))
        } else {
            let mut composite = CompositeStore::new(primary, config.strict);
            for sink_name in &config.sink_backends {
                composite.add_sink(Self::create_backend(sink_name, config)?);
            }
            Ok(Arc::new(composite))
        }
    }

    fn create_backend(
        backend: &str,
        config: &ChatHistoryConfig,
    ) -> Result<Box<dyn ChatHistoryStore>> {
        match backend {
            "memory" => {
                let store = match config.memory_max_messages {
                    Some(max) => MemoryChatHistoryStore::with_max_messages(max),
                    None => MemoryChatHistoryStore::new(),
                };
                Ok(Box::new(store))
            }
            "jsonl" => {
                let path = config.jsonl_path.as_ref().ok_or_else(|| {
                    ChatHistoryError::InvalidInput("JSONL path not configured".to_string())
                })?;
                Ok(Box::new(JsonlChatHistoryStore::new(path)))
            }
            _ => Err(ChatHistoryError::InvalidInput(format!(
                "Unknown backend: {}",
                backend
            ))),
        }
    }

    /// Check if chat history is enabled
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Get the privacy level
    pub fn privacy_level(&self) -> PrivacyLevel {
        self.config.privacy_level
    }

    /// Build a message honoring the configured privacy level.
    pub fn new_message(&self, conversation_id: &str, role: MessageRole, content: &str) -> Message {
        Message::new(
            conversation_id.to_string(),
            role,
            content,
            self.config.privacy_level,
        )
    }

    /// Fetch a conversation, touching it, or create it when absent.
    pub async fn open_conversation(&self, conversation_id: &str) -> Result<Conversation> {
        let conversation = match self.store.get_conversation(conversation_id).await {
            Ok(mut existing) => {
                existing.touch();
                existing
            }
            Err(ChatHistoryError::NotFound(_)) => Conversation::new(conversation_id.to_string()),
            Err(e) => return Err(e),
        };
        self.record_conversation(&conversation).await?;
        Ok(conversation)
    }

    /// Record a conversation
    pub async fn record_conversation(&self, conversation: &Conversation) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        self.store.record_conversation(conversation).await
    }

    /// Record a message
    pub async fn record_message(&self, message: &Message) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        self.store.record_message(message).await
    }

    /// Record multiple messages
    pub async fn record_messages(&self, messages: &[Message]) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        self.store.record_messages(messages).await
    }

    pub async fn record_routing_log(&self, log: &RoutingLog) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        self.store.record_routing_log(log).await
    }

    /// Persist a finalized exchange.
    ///
    /// Api-call logs are written first and best effort. The assistant message is the
    /// last write and the only one whose failure is returned, so an error here never
    /// leaves the message stored.
    pub async fn record_exchange(&self, message: &Message, api_calls: &[ApiCallLog]) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        for log in api_calls {
            if let Err(e) = self.store.record_api_call(log).await {
                tracing::warn!("Failed to record api call {}: {}", log.log_id, e);
            }
        }
        self.store.record_message(message).await
    }

    /// Record the api-call logs of a failed exchange.
    pub async fn record_api_calls(&self, api_calls: &[ApiCallLog]) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        for log in api_calls {
            self.store.record_api_call(log).await?;
        }
        Ok(())
    }

    /// Create a branch after an existing message.
    pub async fn create_sub_conversation(
        &self,
        conversation_id: &str,
        parent_message_id: &str,
        title: Option<String>,
    ) -> Result<SubConversation> {
        let mut sub =
            SubConversation::new(conversation_id.to_string(), parent_message_id.to_string());
        sub.title = title;
        self.store.record_sub_conversation(&sub).await?;
        Ok(sub)
    }

    /// Get a conversation by ID
    pub async fn get_conversation(&self, conversation_id: &str) -> Result<Conversation> {
        self.store.get_conversation(conversation_id).await
    }

    pub async fn get_sub_conversation(&self, sub_conversation_id: &str) -> Result<SubConversation> {
        self.store.get_sub_conversation(sub_conversation_id).await
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Message> {
        self.store.get_message(message_id).await
    }

    /// List conversations with filters
    pub async fn list_conversations(
        &self,
        filters: &ConversationFilters,
    ) -> Result<Vec<Conversation>> {
        self.store.list_conversations(filters).await
    }

    /// List messages with filters
    pub async fn list_messages(&self, filters: &MessageFilters) -> Result<Vec<Message>> {
        self.store.list_messages(filters).await
    }

    /// Prior turns visible from a conversation or one of its branches, oldest first.
    ///
    /// A branch sees the main line up to and including its parent message, then its
    /// own messages.
    pub async fn thread(
        &self,
        conversation_id: &str,
        sub_conversation_id: Option<&str>,
    ) -> Result<Vec<Message>> {
        let all = self
            .store
            .list_messages(&MessageFilters::for_conversation(conversation_id))
            .await?;
        match sub_conversation_id {
            None => Ok(all
                .into_iter()
                .filter(|m| m.sub_conversation_id.is_none())
                .collect()),
            Some(sub_id) => {
                let sub = self.store.get_sub_conversation(sub_id).await?;
                let mut thread = Vec::new();
                for message in all.iter().filter(|m| m.sub_conversation_id.is_none()) {
                    thread.push(message.clone());
                    if message.message_id == sub.parent_message_id {
                        break;
                    }
                }
                thread.extend(
                    all.into_iter()
                        .filter(|m| m.sub_conversation_id.as_deref() == Some(sub_id)),
                );
                Ok(thread)
            }
        }
    }

    pub async fn list_sub_conversations(&self, conversation_id: &str) -> Result<Vec<SubConversation>> {
        self.store.list_sub_conversations(conversation_id).await
    }

    pub async fn list_routing_logs(&self, conversation_id: &str) -> Result<Vec<RoutingLog>> {
        self.store.list_routing_logs(conversation_id).await
    }

    pub async fn list_api_calls(&self, conversation_id: &str) -> Result<Vec<ApiCallLog>> {
        self.store.list_api_calls(conversation_id).await
    }

    /// Delete a conversation
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        self.store.delete_conversation(conversation_id).await
    }

    /// Clear all data
    pub async fn clear(&self) -> Result<()> {
        self.store.clear().await
    }

    /// Get storage statistics
    pub async fn stats(&self) -> Result<StorageStats> {
        self.store.stats().await
    }

    /// Health check
    pub async fn health(&self) -> Result<bool> {
        self.store.health().await
    }
}
