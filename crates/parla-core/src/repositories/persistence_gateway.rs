use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::RepositoryResult;
use crate::models::conversation::{AudioEntry, Message, MessageContent, Role};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Conversation header row. Message and audio rows reference it by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: MessageContent,
    #[serde(default)]
    pub tool_used: bool,
    pub created_at: DateTime<Utc>,
}

impl MessageRow {
    pub fn from_message(conversation_id: &str, message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            conversation_id: conversation_id.to_string(),
            role: message.role,
            content: message.content.clone(),
            tool_used: message.tool_used,
            created_at: message.timestamp,
        }
    }

    pub fn into_message(self) -> Message {
        Message {
            id: self.id,
            role: self.role,
            content: self.content.normalized(),
            timestamp: self.created_at,
            tool_used: self.tool_used,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioRow {
    pub id: String,
    pub conversation_id: String,
    pub text: String,
    pub audio_url: String,
    pub timestamp_ms: i64,
    pub voice_id: String,
    pub voice_name: String,
}

impl AudioRow {
    pub fn from_entry(conversation_id: &str, entry: &AudioEntry) -> Self {
        Self {
            id: entry.id.clone(),
            conversation_id: conversation_id.to_string(),
            text: entry.text.clone(),
            audio_url: entry.audio_uri.clone(),
            timestamp_ms: entry.timestamp.timestamp_millis(),
            voice_id: entry.voice_id.clone(),
            voice_name: entry.voice_name.clone(),
        }
    }

    pub fn into_entry(self) -> AudioEntry {
        AudioEntry {
            id: self.id,
            text: self.text,
            audio_uri: self.audio_url,
            timestamp: DateTime::from_timestamp_millis(self.timestamp_ms).unwrap_or_default(),
            voice_id: self.voice_id,
            voice_name: self.voice_name,
        }
    }
}

/// Durable mirror of the conversation store.
///
/// Every operation is keyed by client-generated ids and upserts are idempotent, so the
/// store may replay a write without changing the outcome. Backends must refuse message
/// and audio rows whose conversation row they do not hold.
pub trait PersistenceGateway: Send + Sync + 'static {
    /// Insert or update a conversation header. `created_at` of an existing row is kept.
    fn upsert_conversation(&self, row: ConversationRow) -> BoxFuture<'static, RepositoryResult<()>>;

    fn upsert_messages(&self, rows: Vec<MessageRow>) -> BoxFuture<'static, RepositoryResult<()>>;

    fn upsert_audio(&self, row: AudioRow) -> BoxFuture<'static, RepositoryResult<()>>;

    /// Delete a conversation together with its message and audio rows.
    fn delete_conversation(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>>;

    fn delete_audio(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>>;

    /// Conversation headers owned by `user_id`, most recently updated first.
    fn fetch_conversations(
        &self,
        user_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<ConversationRow>>>;

    /// Messages of one conversation in chronological order.
    fn fetch_messages(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<MessageRow>>>;

    /// Audio rows of one conversation, most recent first.
    fn fetch_audio(&self, conversation_id: &str)
    -> BoxFuture<'static, RepositoryResult<Vec<AudioRow>>>;
}
