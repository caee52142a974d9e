use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use super::conversation::{Conversation, Message, sort_by_recency};
use crate::repositories::{
    AudioRow, ConversationRow, MessageRow, PersistenceGateway, RepositoryError, RepositoryResult,
};

enum PersistenceJob {
    SaveConversation {
        header: ConversationRow,
        messages: Vec<MessageRow>,
    },
    SaveAudio {
        header: ConversationRow,
        audio: AudioRow,
    },
    SaveHeader {
        header: ConversationRow,
    },
    DeleteConversation {
        id: String,
    },
    DeleteAudio {
        id: String,
    },
    FetchMessages {
        conversation_id: String,
        reply: oneshot::Sender<RepositoryResult<Vec<Message>>>,
    },
    LoadUser {
        user_id: String,
        reply: oneshot::Sender<RepositoryResult<Vec<Conversation>>>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
}

/// Serializes all traffic to a [`PersistenceGateway`] through one worker task.
///
/// Jobs run in submission order, so a conversation header always lands before the rows that
/// reference it and a read observes every write enqueued before it. Write failures are
/// logged and dropped.
#[derive(Clone)]
pub struct PersistenceQueue {
    sender: mpsc::UnboundedSender<PersistenceJob>,
}

impl PersistenceQueue {
    /// Spawn the worker on the current tokio runtime.
    pub fn spawn(gateway: Arc<dyn PersistenceGateway>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(gateway, receiver));
        Self { sender }
    }

    fn enqueue(&self, job: PersistenceJob) {
        if self.sender.send(job).is_err() {
            error!("Persistence worker stopped, dropping write");
        }
    }

    /// Upsert the header, then the given message rows.
    pub fn save_conversation(&self, header: ConversationRow, messages: Vec<MessageRow>) {
        self.enqueue(PersistenceJob::SaveConversation { header, messages });
    }

    pub fn save_audio(&self, header: ConversationRow, audio: AudioRow) {
        self.enqueue(PersistenceJob::SaveAudio { header, audio });
    }

    pub fn save_header(&self, header: ConversationRow) {
        self.enqueue(PersistenceJob::SaveHeader { header });
    }

    pub fn delete_conversation(&self, id: &str) {
        self.enqueue(PersistenceJob::DeleteConversation { id: id.to_string() });
    }

    pub fn delete_audio(&self, id: &str) {
        self.enqueue(PersistenceJob::DeleteAudio { id: id.to_string() });
    }

    pub async fn fetch_messages(&self, conversation_id: &str) -> RepositoryResult<Vec<Message>> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(PersistenceJob::FetchMessages {
                conversation_id: conversation_id.to_string(),
                reply,
            })
            .map_err(|_| RepositoryError::WorkerStopped)?;
        response.await.map_err(|_| RepositoryError::WorkerStopped)?
    }

    /// Every conversation of `user_id`, with messages and audio materialized, by recency.
    pub async fn load_user(&self, user_id: &str) -> RepositoryResult<Vec<Conversation>> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(PersistenceJob::LoadUser {
                user_id: user_id.to_string(),
                reply,
            })
            .map_err(|_| RepositoryError::WorkerStopped)?;
        response.await.map_err(|_| RepositoryError::WorkerStopped)?
    }

    /// Wait until every job enqueued so far has run.
    pub async fn flush(&self) {
        let (reply, done) = oneshot::channel();
        if self.sender.send(PersistenceJob::Flush { reply }).is_err() {
            return;
        }
        let _ = done.await;
    }
}

async fn run_worker(
    gateway: Arc<dyn PersistenceGateway>,
    mut receiver: mpsc::UnboundedReceiver<PersistenceJob>,
) {
    while let Some(job) = receiver.recv().await {
        match job {
            PersistenceJob::SaveConversation { header, messages } => {
                let conversation_id = header.id.clone();
                if let Err(e) = gateway.upsert_conversation(header).await {
                    error!(conversation_id = %conversation_id, error = ?e, "Failed to upsert conversation, skipping its messages");
                    continue;
                }
                if messages.is_empty() {
                    continue;
                }
                let count = messages.len();
                match gateway.upsert_messages(messages).await {
                    Ok(()) => debug!(conversation_id = %conversation_id, count, "Persisted messages"),
                    Err(e) => error!(conversation_id = %conversation_id, error = ?e, "Failed to persist messages"),
                }
            }
            PersistenceJob::SaveAudio { header, audio } => {
                let conversation_id = header.id.clone();
                if let Err(e) = gateway.upsert_conversation(header).await {
                    error!(conversation_id = %conversation_id, error = ?e, "Failed to upsert conversation, skipping audio");
                    continue;
                }
                if let Err(e) = gateway.upsert_audio(audio).await {
                    error!(conversation_id = %conversation_id, error = ?e, "Failed to persist audio entry");
                }
            }
            PersistenceJob::SaveHeader { header } => {
                let conversation_id = header.id.clone();
                if let Err(e) = gateway.upsert_conversation(header).await {
                    error!(conversation_id = %conversation_id, error = ?e, "Failed to update conversation");
                }
            }
            PersistenceJob::DeleteConversation { id } => {
                if let Err(e) = gateway.delete_conversation(&id).await {
                    error!(conversation_id = %id, error = ?e, "Failed to delete conversation");
                }
            }
            PersistenceJob::DeleteAudio { id } => {
                if let Err(e) = gateway.delete_audio(&id).await {
                    error!(audio_id = %id, error = ?e, "Failed to delete audio entry");
                }
            }
            PersistenceJob::FetchMessages {
                conversation_id,
                reply,
            } => {
                let result = gateway
                    .fetch_messages(&conversation_id)
                    .await
                    .map(|rows| rows.into_iter().map(MessageRow::into_message).collect());
                let _ = reply.send(result);
            }
            PersistenceJob::LoadUser { user_id, reply } => {
                let result = load_user(gateway.as_ref(), &user_id).await;
                let _ = reply.send(result);
            }
            PersistenceJob::Flush { reply } => {
                let _ = reply.send(());
            }
        }
    }
    debug!("Persistence worker finished");
}

async fn load_user(
    gateway: &dyn PersistenceGateway,
    user_id: &str,
) -> RepositoryResult<Vec<Conversation>> {
    let headers = gateway.fetch_conversations(user_id).await?;
    let mut conversations = Vec::with_capacity(headers.len());

    for header in headers {
        // A conversation whose rows cannot be read is still listed, just empty
        let messages = match gateway.fetch_messages(&header.id).await {
            Ok(rows) => rows.into_iter().map(MessageRow::into_message).collect(),
            Err(e) => {
                warn!(conversation_id = %header.id, error = ?e, "Failed to load messages");
                Vec::new()
            }
        };
        let audio_entries = match gateway.fetch_audio(&header.id).await {
            Ok(rows) => rows.into_iter().map(AudioRow::into_entry).collect(),
            Err(e) => {
                warn!(conversation_id = %header.id, error = ?e, "Failed to load audio entries");
                Vec::new()
            }
        };

        conversations.push(Conversation {
            id: header.id,
            title: header.title,
            messages,
            audio_entries,
            created_at: header.created_at,
            updated_at: header.updated_at.max(header.created_at),
            title_pinned: false,
        });
    }

    sort_by_recency(&mut conversations);
    debug!(user_id, count = conversations.len(), "Loaded conversations");
    Ok(conversations)
}
