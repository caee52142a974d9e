use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use super::error::{RepositoryError, RepositoryResult};
use super::in_memory_repository::StoreSnapshot;
use super::persistence_gateway::{
    AudioRow, BoxFuture, ConversationRow, MessageRow, PersistenceGateway,
};

/// Row store kept in a single JSON file at ~/.config/parla/conversations.json.
///
/// Every write is a read-modify-write of the whole file, serialized by an async lock and
/// committed by renaming a temp file over the original.
#[derive(Clone)]
pub struct JsonFileGateway {
    file_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl JsonFileGateway {
    pub fn new() -> RepositoryResult<Self> {
        let file_path = dirs::config_dir()
            .ok_or_else(|| RepositoryError::InitializationError {
                message: "Could not determine config directory".to_string(),
            })?
            .join("parla")
            .join("conversations.json");

        Ok(Self::with_path(file_path))
    }

    pub fn with_path(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: Arc::new(file_path.into()),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    async fn load(path: &Path) -> RepositoryResult<StoreSnapshot> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) if content.trim().is_empty() => Ok(StoreSnapshot::default()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No conversation file yet, starting empty");
                Ok(StoreSnapshot::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn store(path: &Path, snapshot: &StoreSnapshot) -> RepositoryResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(snapshot)?;

        // Write to file atomically (write to temp, then rename)
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, json).await?;
        tokio::fs::rename(&temp_path, path).await?;

        Ok(())
    }

    fn modify<F>(&self, apply: F) -> BoxFuture<'static, RepositoryResult<()>>
    where
        F: FnOnce(&mut StoreSnapshot) -> RepositoryResult<()> + Send + 'static,
    {
        let file_path = self.file_path.clone();
        let lock = self.lock.clone();

        Box::pin(async move {
            let _guard = lock.lock().await;
            let mut snapshot = Self::load(&file_path).await?;
            apply(&mut snapshot)?;
            Self::store(&file_path, &snapshot).await
        })
    }

    fn query<T, F>(&self, select: F) -> BoxFuture<'static, RepositoryResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(&StoreSnapshot) -> T + Send + 'static,
    {
        let file_path = self.file_path.clone();
        let lock = self.lock.clone();

        Box::pin(async move {
            let _guard = lock.lock().await;
            let snapshot = Self::load(&file_path).await?;
            Ok(select(&snapshot))
        })
    }
}

impl PersistenceGateway for JsonFileGateway {
    fn upsert_conversation(&self, row: ConversationRow) -> BoxFuture<'static, RepositoryResult<()>> {
        self.modify(move |snapshot| {
            snapshot.upsert_conversation(row);
            Ok(())
        })
    }

    fn upsert_messages(&self, rows: Vec<MessageRow>) -> BoxFuture<'static, RepositoryResult<()>> {
        self.modify(move |snapshot| snapshot.upsert_messages(rows))
    }

    fn upsert_audio(&self, row: AudioRow) -> BoxFuture<'static, RepositoryResult<()>> {
        self.modify(move |snapshot| snapshot.upsert_audio(row))
    }

    fn delete_conversation(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let id = id.to_string();
        self.modify(move |snapshot| {
            snapshot.delete_conversation(&id);
            Ok(())
        })
    }

    fn delete_audio(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let id = id.to_string();
        self.modify(move |snapshot| {
            snapshot.delete_audio(&id);
            Ok(())
        })
    }

    fn fetch_conversations(
        &self,
        user_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<ConversationRow>>> {
        let user_id = user_id.to_string();
        self.query(move |snapshot| snapshot.conversations_of(&user_id))
    }

    fn fetch_messages(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<MessageRow>>> {
        let conversation_id = conversation_id.to_string();
        self.query(move |snapshot| snapshot.messages_of(&conversation_id))
    }

    fn fetch_audio(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<AudioRow>>> {
        let conversation_id = conversation_id.to_string();
        self.query(move |snapshot| snapshot.audio_of(&conversation_id))
    }
}
