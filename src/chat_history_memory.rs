//! In-memory chat history storage backend
//!
//! Fast, simple storage for development and testing.
//! Data is lost when the process exits.

use crate::chat_history::{
    validate_sub_conversation, ApiCallLog, ChatHistoryError, ChatHistoryStore, Conversation,
    ConversationFilters, Message, MessageFilters, Result, RoutingLog, StorageStats,
    SubConversation,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct Tables {
    conversations: HashMap<String, Conversation>,
    sub_conversations: HashMap<String, SubConversation>,
    messages: Vec<Message>,
    routing_logs: Vec<RoutingLog>,
    api_calls: Vec<ApiCallLog>,
}

/// In-memory storage backend
#[derive(Clone, Default)]
pub struct MemoryChatHistoryStore {
    tables: Arc<RwLock<Tables>>,
    max_messages: Option<usize>,
}

impl MemoryChatHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_messages(max_messages: usize) -> Self {
        Self {
            tables: Arc::default(),
            max_messages: Some(max_messages),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|e| ChatHistoryError::Storage(format!("Lock error: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|e| ChatHistoryError::Storage(format!("Lock error: {}", e)))
    }

    fn prune_messages(&self, tables: &mut Tables) {
        if let Some(max) = self.max_messages {
            if tables.messages.len() > max {
                let to_remove = tables.messages.len() - max;
                tables.messages.drain(0..to_remove);
            }
        }
    }
}

#[async_trait::async_trait]
impl ChatHistoryStore for MemoryChatHistoryStore {
    async fn init(&self) -> Result<()> {
        // Nothing to initialize for memory storage
        Ok(())
    }

    async fn record_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.write()?
            .conversations
            .insert(conversation.conversation_id.clone(), conversation.clone());
        Ok(())
    }

    async fn get_conversation(&self, conversation_id: &str) -> Result<Conversation> {
        self.read()?
            .conversations
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| {
                ChatHistoryError::NotFound(format!("Conversation {} not found", conversation_id))
            })
    }

    async fn list_conversations(&self, filters: &ConversationFilters) -> Result<Vec<Conversation>> {
        let tables = self.read()?;
        let mut results: Vec<Conversation> = tables
            .conversations
            .values()
            .filter(|conv| {
                filters.start_time.map_or(true, |s| conv.created_at >= s)
                    && filters.end_time.map_or(true, |e| conv.created_at <= e)
            })
            .cloned()
            .collect();

        // Sort by last_seen_at descending
        results.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));

        if let Some(limit) = filters.limit {
            results.truncate(limit);
        }

        Ok(results)
    }

    async fn record_sub_conversation(&self, sub: &SubConversation) -> Result<()> {
        let mut tables = self.write()?;
        if !tables.conversations.contains_key(&sub.conversation_id) {
            return Err(ChatHistoryError::NotFound(format!(
                "Conversation {} not found",
                sub.conversation_id
            )));
        }
        let parent = tables
            .messages
            .iter()
            .find(|m| m.message_id == sub.parent_message_id);
        validate_sub_conversation(sub, parent)?;
        tables
            .sub_conversations
            .insert(sub.sub_conversation_id.clone(), sub.clone());
        Ok(())
    }

    async fn get_sub_conversation(&self, sub_conversation_id: &str) -> Result<SubConversation> {
        self.read()?
            .sub_conversations
            .get(sub_conversation_id)
            .cloned()
            .ok_or_else(|| {
                ChatHistoryError::NotFound(format!(
                    "Sub-conversation {} not found",
                    sub_conversation_id
                ))
            })
    }

    async fn list_sub_conversations(&self, conversation_id: &str) -> Result<Vec<SubConversation>> {
        let tables = self.read()?;
        let mut results: Vec<SubConversation> = tables
            .sub_conversations
            .values()
            .filter(|s| s.conversation_id == conversation_id)
            .cloned()
            .collect();
        results.sort_by_key(|s| s.created_at);
        Ok(results)
    }

    async fn record_message(&self, message: &Message) -> Result<()> {
        let mut tables = self.write()?;
        tables.messages.push(message.clone());
        self.prune_messages(&mut tables);
        Ok(())
    }

    async fn record_messages(&self, messages: &[Message]) -> Result<()> {
        let mut tables = self.write()?;
        tables.messages.extend_from_slice(messages);
        self.prune_messages(&mut tables);
        Ok(())
    }

    async fn get_message(&self, message_id: &str) -> Result<Message> {
        self.read()?
            .messages
            .iter()
            .find(|m| m.message_id == message_id)
            .cloned()
            .ok_or_else(|| ChatHistoryError::NotFound(format!("Message {} not found", message_id)))
    }

    async fn update_message(&self, message: &Message) -> Result<()> {
        let mut tables = self.write()?;
        match tables
            .messages
            .iter_mut()
            .find(|m| m.message_id == message.message_id)
        {
            Some(existing) => {
                *existing = message.clone();
                Ok(())
            }
            None => Err(ChatHistoryError::NotFound(format!(
                "Message {} not found",
                message.message_id
            ))),
        }
    }

    async fn list_messages(&self, filters: &MessageFilters) -> Result<Vec<Message>> {
        let tables = self.read()?;
        let mut results: Vec<Message> = tables
            .messages
            .iter()
            .filter(|msg| filters.matches(msg))
            .cloned()
            .collect();

        // Sort by created_at ascending
        results.sort_by_key(|m| m.created_at);

        if let Some(limit) = filters.limit {
            results.truncate(limit);
        }

        Ok(results)
    }

    async fn record_routing_log(&self, log: &RoutingLog) -> Result<()> {
        self.write()?.routing_logs.push(log.clone());
        Ok(())
    }

    async fn list_routing_logs(&self, conversation_id: &str) -> Result<Vec<RoutingLog>> {
        Ok(self
            .read()?
            .routing_logs
            .iter()
            .filter(|l| l.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn record_api_call(&self, log: &ApiCallLog) -> Result<()> {
        self.write()?.api_calls.push(log.clone());
        Ok(())
    }

    async fn list_api_calls(&self, conversation_id: &str) -> Result<Vec<ApiCallLog>> {
        Ok(self
            .read()?
            .api_calls
            .iter()
            .filter(|l| l.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        let mut tables = self.write()?;
        tables.conversations.remove(conversation_id);
        tables
            .sub_conversations
            .retain(|_, s| s.conversation_id != conversation_id);
        tables.messages.retain(|m| m.conversation_id != conversation_id);
        tables
            .routing_logs
            .retain(|l| l.conversation_id != conversation_id);
        tables.api_calls.retain(|l| l.conversation_id != conversation_id);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.write()? = Tables::default();
        Ok(())
    }

    async fn stats(&self) -> Result<StorageStats> {
        let tables = self.read()?;
        Ok(StorageStats {
            total_conversations: tables.conversations.len(),
            total_sub_conversations: tables.sub_conversations.len(),
            total_messages: tables.messages.len(),
            total_routing_logs: tables.routing_logs.len(),
            total_api_calls: tables.api_calls.len(),
            backend_type: "memory".to_string(),
            storage_path: None,
        })
    }
}
