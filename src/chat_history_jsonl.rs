//! JSONL chat history storage backend
//!
//! Append-only JSON Lines format for simple persistence and export. Every write
//! appends one `{"type": ..., "data": ...}` record; updates append a newer copy and
//! deletions append a tombstone. Reads replay the file in order, so the last record
//! for an id wins.

use crate::chat_history::{
    validate_sub_conversation, ApiCallLog, ChatHistoryError, ChatHistoryStore, Conversation,
    ConversationFilters, Message, MessageFilters, Result, RoutingLog, StorageStats,
    SubConversation,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
enum JsonlRecord {
    Conversation(Conversation),
    SubConversation(SubConversation),
    Message(Message),
    RoutingLog(RoutingLog),
    ApiCall(ApiCallLog),
    Delete { conversation_id: String },
}

/// Replayed view of the file.
#[derive(Default)]
struct Replay {
    conversations: HashMap<String, Conversation>,
    sub_conversations: HashMap<String, SubConversation>,
    messages: Vec<Message>,
    routing_logs: Vec<RoutingLog>,
    api_calls: Vec<ApiCallLog>,
}

impl Replay {
    fn apply(&mut self, record: JsonlRecord) {
        match record {
            JsonlRecord::Conversation(c) => {
                self.conversations.insert(c.conversation_id.clone(), c);
            }
            JsonlRecord::SubConversation(s) => {
                self.sub_conversations.insert(s.sub_conversation_id.clone(), s);
            }
            JsonlRecord::Message(m) => {
                match self.messages.iter_mut().find(|e| e.message_id == m.message_id) {
                    Some(existing) => *existing = m,
                    None => self.messages.push(m),
                }
            }
            JsonlRecord::RoutingLog(l) => self.routing_logs.push(l),
            JsonlRecord::ApiCall(l) => self.api_calls.push(l),
            JsonlRecord::Delete { conversation_id } => {
                self.conversations.remove(&conversation_id);
                self.sub_conversations
                    .retain(|_, s| s.conversation_id != conversation_id);
                self.messages.retain(|m| m.conversation_id != conversation_id);
                self.routing_logs
                    .retain(|l| l.conversation_id != conversation_id);
                self.api_calls.retain(|l| l.conversation_id != conversation_id);
            }
        }
    }
}

/// JSONL storage backend
#[derive(Clone)]
pub struct JsonlChatHistoryStore {
    path: PathBuf,
    file: Arc<Mutex<Option<File>>>,
}

impl JsonlChatHistoryStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<File>>> {
        self.file
            .lock()
            .map_err(|e| ChatHistoryError::Storage(format!("Lock error: {}", e)))
    }

    fn ensure_file(&self, file_guard: &mut Option<File>) -> Result<()> {
        if file_guard.is_none() {
            // Create parent directories
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }

            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;

            *file_guard = Some(file);
        }

        Ok(())
    }

    fn append(&self, file_guard: &mut Option<File>, record: &JsonlRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        self.ensure_file(file_guard)?;
        if let Some(ref mut file) = *file_guard {
            writeln!(file, "{}", line)?;
            file.flush()?;
        }
        Ok(())
    }

    fn write_record(&self, record: &JsonlRecord) -> Result<()> {
        let mut guard = self.lock()?;
        self.append(&mut guard, record)
    }

    fn replay(&self) -> Result<Replay> {
        let mut state = Replay::default();
        if !self.path.exists() {
            return Ok(state);
        }

        let reader = BufReader::new(File::open(&self.path)?);
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JsonlRecord>(&line) {
                Ok(record) => state.apply(record),
                Err(e) => tracing::debug!(
                    "Skipping unreadable line {} in {}: {}",
                    index + 1,
                    self.path.display(),
                    e
                ),
            }
        }
        Ok(state)
    }
}

#[async_trait::async_trait]
impl ChatHistoryStore for JsonlChatHistoryStore {
    async fn init(&self) -> Result<()> {
        let mut guard = self.lock()?;
        self.ensure_file(&mut guard)
    }

    async fn record_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.write_record(&JsonlRecord::Conversation(conversation.clone()))
    }

    async fn get_conversation(&self, conversation_id: &str) -> Result<Conversation> {
        self.replay()?
            .conversations
            .remove(conversation_id)
            .ok_or_else(|| {
                ChatHistoryError::NotFound(format!("Conversation {} not found", conversation_id))
            })
    }

    async fn list_conversations(&self, filters: &ConversationFilters) -> Result<Vec<Conversation>> {
        let mut results: Vec<Conversation> = self
            .replay()?
            .conversations
            .into_values()
            .filter(|conv| {
                filters.start_time.map_or(true, |s| conv.created_at >= s)
                    && filters.end_time.map_or(true, |e| conv.created_at <= e)
            })
            .collect();

        // Sort by last_seen_at descending
        results.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));

        if let Some(limit) = filters.limit {
            results.truncate(limit);
        }

        Ok(results)
    }

    async fn record_sub_conversation(&self, sub: &SubConversation) -> Result<()> {
        // Hold the file lock across validation so the check and the append agree.
        let mut guard = self.lock()?;
        let state = self.replay()?;
        if !state.conversations.contains_key(&sub.conversation_id) {
            return Err(ChatHistoryError::NotFound(format!(
                "Conversation {} not found",
                sub.conversation_id
            )));
        }
        let parent = state
            .messages
            .iter()
            .find(|m| m.message_id == sub.parent_message_id);
        validate_sub_conversation(sub, parent)?;
        self.append(&mut guard, &JsonlRecord::SubConversation(sub.clone()))
    }

    async fn get_sub_conversation(&self, sub_conversation_id: &str) -> Result<SubConversation> {
        self.replay()?
            .sub_conversations
            .remove(sub_conversation_id)
            .ok_or_else(|| {
                ChatHistoryError::NotFound(format!(
                    "Sub-conversation {} not found",
                    sub_conversation_id
                ))
            })
    }

    async fn list_sub_conversations(&self, conversation_id: &str) -> Result<Vec<SubConversation>> {
        let mut results: Vec<SubConversation> = self
            .replay()?
            .sub_conversations
            .into_values()
            .filter(|s| s.conversation_id == conversation_id)
            .collect();
        results.sort_by_key(|s| s.created_at);
        Ok(results)
    }

    async fn record_message(&self, message: &Message) -> Result<()> {
        self.write_record(&JsonlRecord::Message(message.clone()))
    }

    async fn get_message(&self, message_id: &str) -> Result<Message> {
        self.replay()?
            .messages
            .into_iter()
            .find(|m| m.message_id == message_id)
            .ok_or_else(|| ChatHistoryError::NotFound(format!("Message {} not found", message_id)))
    }

    async fn update_message(&self, message: &Message) -> Result<()> {
        let mut guard = self.lock()?;
        if !self
            .replay()?
            .messages
            .iter()
            .any(|m| m.message_id == message.message_id)
        {
            return Err(ChatHistoryError::NotFound(format!(
                "Message {} not found",
                message.message_id
            )));
        }
        self.append(&mut guard, &JsonlRecord::Message(message.clone()))
    }

    async fn list_messages(&self, filters: &MessageFilters) -> Result<Vec<Message>> {
        let mut results: Vec<Message> = self
            .replay()?
            .messages
            .into_iter()
            .filter(|msg| filters.matches(msg))
            .collect();

        // Sort by created_at ascending
        results.sort_by_key(|m| m.created_at);

        if let Some(limit) = filters.limit {
            results.truncate(limit);
        }

        Ok(results)
    }

    async fn record_routing_log(&self, log: &RoutingLog) -> Result<()> {
        self.write_record(&JsonlRecord::RoutingLog(log.clone()))
    }

    async fn list_routing_logs(&self, conversation_id: &str) -> Result<Vec<RoutingLog>> {
        Ok(self
            .replay()?
            .routing_logs
            .into_iter()
            .filter(|l| l.conversation_id == conversation_id)
            .collect())
    }

    async fn record_api_call(&self, log: &ApiCallLog) -> Result<()> {
        self.write_record(&JsonlRecord::ApiCall(log.clone()))
    }

    async fn list_api_calls(&self, conversation_id: &str) -> Result<Vec<ApiCallLog>> {
        Ok(self
            .replay()?
            .api_calls
            .into_iter()
            .filter(|l| l.conversation_id == conversation_id)
            .collect())
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        self.write_record(&JsonlRecord::Delete {
            conversation_id: conversation_id.to_string(),
        })
    }

    async fn clear(&self) -> Result<()> {
        let mut file_guard = self.lock()?;
        // Reset the file handle before removing the file
        *file_guard = None;
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    async fn stats(&self) -> Result<StorageStats> {
        let state = self.replay()?;
        Ok(StorageStats {
            total_conversations: state.conversations.len(),
            total_sub_conversations: state.sub_conversations.len(),
            total_messages: state.messages.len(),
            total_routing_logs: state.routing_logs.len(),
            total_api_calls: state.api_calls.len(),
            backend_type: "jsonl".to_string(),
            storage_path: Some(self.path.to_string_lossy().to_string()),
        })
    }

    async fn health(&self) -> Result<bool> {
        // Check if we can write to the file
        let mut guard = self.lock()?;
        self.ensure_file(&mut guard)?;
        Ok(true)
    }
}
