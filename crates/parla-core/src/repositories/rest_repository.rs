use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::{RepositoryError, RepositoryResult};
use super::persistence_gateway::{
    AudioRow, BoxFuture, ConversationRow, MessageRow, PersistenceGateway,
};
use crate::models::conversation::{MessageContent, Role};

const CONVERSATIONS: &str = "conversations";
const MESSAGES: &str = "messages";
const AUDIO: &str = "tts_audios";

const UPSERT_PREFERENCE: &str = "resolution=merge-duplicates,return=minimal";

/// Message row as the remote table stores it: content is always a text column.
#[derive(Debug, Serialize, Deserialize)]
struct RemoteMessage {
    id: String,
    conversation_id: String,
    role: Role,
    content: serde_json::Value,
    #[serde(default)]
    tool_used: bool,
    created_at: DateTime<Utc>,
}

impl From<MessageRow> for RemoteMessage {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            conversation_id: row.conversation_id,
            role: row.role,
            content: serde_json::Value::String(row.content.to_stored_text()),
            tool_used: row.tool_used,
            created_at: row.created_at,
        }
    }
}

impl RemoteMessage {
    /// Older rows may hold content as a JSON array rather than encoded text.
    fn into_row(self) -> MessageRow {
        let content = match self.content {
            serde_json::Value::String(text) => MessageContent::from_stored_text(&text),
            other => serde_json::from_value(other.clone())
                .unwrap_or_else(|_| MessageContent::Text(other.to_string())),
        };

        MessageRow {
            id: self.id,
            conversation_id: self.conversation_id,
            role: self.role,
            content,
            tool_used: self.tool_used,
            created_at: self.created_at,
        }
    }
}

/// Row store behind a PostgREST-style HTTP API (`{base}/rest/v1/{table}`).
///
/// Writes are upserts with merge-duplicates resolution, so replays are harmless.
/// The remote schema is expected to cascade or tolerate the explicit child deletes
/// issued before a conversation delete.
#[derive(Clone)]
pub struct RestGateway {
    client: reqwest::Client,
    base_url: String,
}

impl RestGateway {
    /// `access_token` authorizes as a signed-in user; the API key is used when absent.
    pub fn new(
        base_url: &str,
        api_key: &str,
        access_token: Option<&str>,
    ) -> RepositoryResult<Self> {
        let invalid = |what: &str| RepositoryError::InitializationError {
            message: format!("Invalid {} for remote store", what),
        };

        let mut headers = HeaderMap::new();
        headers.insert(
            "apikey",
            HeaderValue::from_str(api_key).map_err(|_| invalid("API key"))?,
        );
        let bearer = format!("Bearer {}", access_token.unwrap_or(api_key));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&bearer).map_err(|_| invalid("access token"))?,
        );

        let client = reqwest::Client::builder()
            .user_agent("parla/0.1")
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    async fn ensure_success(
        operation: &'static str,
        response: reqwest::Response,
    ) -> RepositoryResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(RepositoryError::StatusError {
            operation,
            status: status.as_u16(),
            body,
        })
    }

    fn upsert<T>(
        &self,
        operation: &'static str,
        table: &str,
        rows: Vec<T>,
    ) -> BoxFuture<'static, RepositoryResult<()>>
    where
        T: Serialize + Send + 'static,
    {
        let client = self.client.clone();
        let url = self.table_url(table);
        Box::pin(async move {
            if rows.is_empty() {
                return Ok(());
            }
            debug!(operation, rows = rows.len(), "Remote upsert");

            let response = client
                .post(&url)
                .header("Prefer", UPSERT_PREFERENCE)
                .json(&rows)
                .send()
                .await?;
            Self::ensure_success(operation, response).await?;
            Ok(())
        })
    }

    async fn delete_where(
        client: &reqwest::Client,
        operation: &'static str,
        url: &str,
        column: &str,
        value: &str,
    ) -> RepositoryResult<()> {
        let response = client
            .delete(url)
            .query(&[(column, format!("eq.{}", value))])
            .send()
            .await?;
        Self::ensure_success(operation, response).await?;
        Ok(())
    }

    fn select<T>(
        &self,
        operation: &'static str,
        table: &str,
        query: Vec<(&'static str, String)>,
    ) -> BoxFuture<'static, RepositoryResult<Vec<T>>>
    where
        T: for<'de> Deserialize<'de> + Send + 'static,
    {
        let client = self.client.clone();
        let url = self.table_url(table);
        Box::pin(async move {
            let response = client.get(&url).query(&query).send().await?;
            let response = Self::ensure_success(operation, response).await?;
            Ok(response.json::<Vec<T>>().await?)
        })
    }
}

impl PersistenceGateway for RestGateway {
    fn upsert_conversation(&self, row: ConversationRow) -> BoxFuture<'static, RepositoryResult<()>> {
        self.upsert("upsert conversation", CONVERSATIONS, vec![row])
    }

    fn upsert_messages(&self, rows: Vec<MessageRow>) -> BoxFuture<'static, RepositoryResult<()>> {
        let rows: Vec<RemoteMessage> = rows.into_iter().map(RemoteMessage::from).collect();
        self.upsert("upsert messages", MESSAGES, rows)
    }

    fn upsert_audio(&self, row: AudioRow) -> BoxFuture<'static, RepositoryResult<()>> {
        self.upsert("upsert audio", AUDIO, vec![row])
    }

    fn delete_conversation(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let client = self.client.clone();
        let messages_url = self.table_url(MESSAGES);
        let audio_url = self.table_url(AUDIO);
        let conversations_url = self.table_url(CONVERSATIONS);
        let id = id.to_string();
        Box::pin(async move {
            Self::delete_where(&client, "delete messages", &messages_url, "conversation_id", &id)
                .await?;
            Self::delete_where(&client, "delete audio", &audio_url, "conversation_id", &id)
                .await?;
            Self::delete_where(&client, "delete conversation", &conversations_url, "id", &id)
                .await
        })
    }

    fn delete_audio(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let client = self.client.clone();
        let url = self.table_url(AUDIO);
        let id = id.to_string();
        Box::pin(async move { Self::delete_where(&client, "delete audio", &url, "id", &id).await })
    }

    fn fetch_conversations(
        &self,
        user_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<ConversationRow>>> {
        self.select(
            "fetch conversations",
            CONVERSATIONS,
            vec![
                ("select", "id,user_id,title,created_at,updated_at".to_string()),
                ("user_id", format!("eq.{}", user_id)),
                ("order", "updated_at.desc,created_at.desc".to_string()),
            ],
        )
    }

    fn fetch_messages(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<MessageRow>>> {
        let remote = self.select::<RemoteMessage>(
            "fetch messages",
            MESSAGES,
            vec![
                ("select", "id,conversation_id,role,content,tool_used,created_at".to_string()),
                ("conversation_id", format!("eq.{}", conversation_id)),
                ("order", "created_at.asc".to_string()),
            ],
        );
        Box::pin(async move {
            Ok(remote
                .await?
                .into_iter()
                .map(RemoteMessage::into_row)
                .collect())
        })
    }

    fn fetch_audio(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<AudioRow>>> {
        self.select(
            "fetch audio",
            AUDIO,
            vec![
                (
                    "select",
                    "id,conversation_id,text,audio_url,timestamp_ms,voice_id,voice_name".to_string(),
                ),
                ("conversation_id", format!("eq.{}", conversation_id)),
                ("order", "timestamp_ms.desc".to_string()),
            ],
        )
    }
}
