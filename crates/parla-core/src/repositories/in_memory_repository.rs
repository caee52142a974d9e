use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::error::{RepositoryError, RepositoryResult};
use super::persistence_gateway::{
    AudioRow, BoxFuture, ConversationRow, MessageRow, PersistenceGateway,
};

/// Full contents of a row store. Also the on-disk format of the JSON file backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub conversations: Vec<ConversationRow>,
    #[serde(default)]
    pub messages: Vec<MessageRow>,
    #[serde(default)]
    pub audio: Vec<AudioRow>,
}

impl StoreSnapshot {
    fn has_conversation(&self, id: &str) -> bool {
        self.conversations.iter().any(|row| row.id == id)
    }

    fn missing_parent(kind: &str, id: &str, conversation_id: &str) -> RepositoryError {
        RepositoryError::InvalidData {
            message: format!(
                "{} {} references unknown conversation {}",
                kind, id, conversation_id
            ),
        }
    }

    pub(crate) fn upsert_conversation(&mut self, row: ConversationRow) {
        match self.conversations.iter_mut().find(|c| c.id == row.id) {
            Some(existing) => {
                existing.user_id = row.user_id;
                existing.title = row.title;
                existing.updated_at = row.updated_at;
            }
            None => self.conversations.push(row),
        }
    }

    /// All-or-nothing: nothing is written if any row lacks its conversation.
    pub(crate) fn upsert_messages(&mut self, rows: Vec<MessageRow>) -> RepositoryResult<()> {
        if let Some(orphan) = rows
            .iter()
            .find(|row| !self.has_conversation(&row.conversation_id))
        {
            return Err(Self::missing_parent(
                "Message",
                &orphan.id,
                &orphan.conversation_id,
            ));
        }

        for row in rows {
            match self.messages.iter_mut().find(|m| m.id == row.id) {
                Some(existing) => *existing = row,
                None => self.messages.push(row),
            }
        }
        Ok(())
    }

    pub(crate) fn upsert_audio(&mut self, row: AudioRow) -> RepositoryResult<()> {
        if !self.has_conversation(&row.conversation_id) {
            return Err(Self::missing_parent(
                "Audio entry",
                &row.id,
                &row.conversation_id,
            ));
        }

        match self.audio.iter_mut().find(|a| a.id == row.id) {
            Some(existing) => *existing = row,
            None => self.audio.push(row),
        }
        Ok(())
    }

    pub(crate) fn delete_conversation(&mut self, id: &str) {
        self.messages.retain(|row| row.conversation_id != id);
        self.audio.retain(|row| row.conversation_id != id);
        self.conversations.retain(|row| row.id != id);
    }

    pub(crate) fn delete_audio(&mut self, id: &str) {
        self.audio.retain(|row| row.id != id);
    }

    pub(crate) fn conversations_of(&self, user_id: &str) -> Vec<ConversationRow> {
        let mut rows: Vec<ConversationRow> = self
            .conversations
            .iter()
            .filter(|row| row.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        rows
    }

    pub(crate) fn messages_of(&self, conversation_id: &str) -> Vec<MessageRow> {
        let mut rows: Vec<MessageRow> = self
            .messages
            .iter()
            .filter(|row| row.conversation_id == conversation_id)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        rows
    }

    pub(crate) fn audio_of(&self, conversation_id: &str) -> Vec<AudioRow> {
        let mut rows: Vec<AudioRow> = self
            .audio
            .iter()
            .filter(|row| row.conversation_id == conversation_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
        rows
    }
}

/// In-memory row store.
/// Useful for testing and for sessions that should leave nothing behind.
#[derive(Clone, Default)]
pub struct InMemoryGateway {
    tables: Arc<Mutex<StoreSnapshot>>,
    fail_writes: Arc<AtomicBool>,
    writes: Arc<AtomicUsize>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populated store, e.g. to simulate data written by another device.
    pub fn with_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            tables: Arc::new(Mutex::new(snapshot)),
            ..Self::default()
        }
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.tables.lock().clone()
    }

    /// Make every subsequent write fail until switched back off.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of write operations attempted, failed ones included.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn write<T, F>(&self, operation: &'static str, apply: F) -> BoxFuture<'static, RepositoryResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut StoreSnapshot) -> RepositoryResult<T> + Send + 'static,
    {
        let tables = self.tables.clone();
        let fail_writes = self.fail_writes.clone();
        let writes = self.writes.clone();

        Box::pin(async move {
            writes.fetch_add(1, Ordering::SeqCst);
            if fail_writes.load(Ordering::SeqCst) {
                return Err(RepositoryError::StatusError {
                    operation,
                    status: 503,
                    body: "writes disabled".to_string(),
                });
            }
            let mut tables = tables.lock();
            apply(&mut tables)
        })
    }

    fn read<T, F>(&self, query: F) -> BoxFuture<'static, RepositoryResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(&StoreSnapshot) -> T + Send + 'static,
    {
        let tables = self.tables.clone();
        Box::pin(async move { Ok(query(&tables.lock())) })
    }
}

impl PersistenceGateway for InMemoryGateway {
    fn upsert_conversation(&self, row: ConversationRow) -> BoxFuture<'static, RepositoryResult<()>> {
        self.write("upsert conversation", move |tables| {
            tables.upsert_conversation(row);
            Ok(())
        })
    }

    fn upsert_messages(&self, rows: Vec<MessageRow>) -> BoxFuture<'static, RepositoryResult<()>> {
        self.write("upsert messages", move |tables| tables.upsert_messages(rows))
    }

    fn upsert_audio(&self, row: AudioRow) -> BoxFuture<'static, RepositoryResult<()>> {
        self.write("upsert audio", move |tables| tables.upsert_audio(row))
    }

    fn delete_conversation(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let id = id.to_string();
        self.write("delete conversation", move |tables| {
            tables.delete_conversation(&id);
            Ok(())
        })
    }

    fn delete_audio(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let id = id.to_string();
        self.write("delete audio", move |tables| {
            tables.delete_audio(&id);
            Ok(())
        })
    }

    fn fetch_conversations(
        &self,
        user_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<ConversationRow>>> {
        let user_id = user_id.to_string();
        self.read(move |tables| tables.conversations_of(&user_id))
    }

    fn fetch_messages(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<MessageRow>>> {
        let conversation_id = conversation_id.to_string();
        self.read(move |tables| tables.messages_of(&conversation_id))
    }

    fn fetch_audio(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<AudioRow>>> {
        let conversation_id = conversation_id.to_string();
        self.read(move |tables| tables.audio_of(&conversation_id))
    }
}
