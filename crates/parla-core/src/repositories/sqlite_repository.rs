use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use tracing::info;

use super::error::{RepositoryError, RepositoryResult};
use super::persistence_gateway::{
    AudioRow, BoxFuture, ConversationRow, MessageRow, PersistenceGateway,
};
use crate::models::conversation::{MessageContent, Role};

/// Migrations applied in order. Each entry is (version, sql).
/// Append new versions, never edit existing entries.
const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    "CREATE TABLE IF NOT EXISTS conversations (
        id         TEXT    PRIMARY KEY,
        user_id    TEXT    NOT NULL,
        title      TEXT    NOT NULL DEFAULT '',
        created_at INTEGER NOT NULL DEFAULT 0,
        updated_at INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_conversations_user_updated
        ON conversations (user_id, updated_at DESC);
    CREATE TABLE IF NOT EXISTS messages (
        id              TEXT    PRIMARY KEY,
        conversation_id TEXT    NOT NULL REFERENCES conversations (id) ON DELETE CASCADE,
        role            TEXT    NOT NULL,
        content         TEXT    NOT NULL DEFAULT '',
        tool_used       INTEGER NOT NULL DEFAULT 0,
        created_at      INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_messages_conversation
        ON messages (conversation_id, created_at);
    CREATE TABLE IF NOT EXISTS audio_entries (
        id              TEXT    PRIMARY KEY,
        conversation_id TEXT    NOT NULL REFERENCES conversations (id) ON DELETE CASCADE,
        text            TEXT    NOT NULL DEFAULT '',
        audio_url       TEXT    NOT NULL DEFAULT '',
        timestamp_ms    INTEGER NOT NULL DEFAULT 0,
        voice_id        TEXT    NOT NULL DEFAULT '',
        voice_name      TEXT    NOT NULL DEFAULT ''
    );
    CREATE INDEX IF NOT EXISTS idx_audio_conversation
        ON audio_entries (conversation_id, timestamp_ms DESC);",
)];

fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

fn conversation_from_row(row: &SqliteRow) -> ConversationRow {
    ConversationRow {
        id: row.get("id"),
        user_id: row.get("user_id"),
        title: row.get("title"),
        created_at: from_micros(row.get("created_at")),
        updated_at: from_micros(row.get("updated_at")),
    }
}

fn message_from_row(row: &SqliteRow) -> RepositoryResult<MessageRow> {
    let id: String = row.get("id");
    let role: String = row.get("role");
    let role = Role::parse(&role).ok_or_else(|| RepositoryError::InvalidData {
        message: format!("Message {} has unknown role '{}'", id, role),
    })?;
    let content: String = row.get("content");

    Ok(MessageRow {
        id,
        conversation_id: row.get("conversation_id"),
        role,
        content: MessageContent::from_stored_text(&content),
        tool_used: row.get("tool_used"),
        created_at: from_micros(row.get("created_at")),
    })
}

fn audio_from_row(row: &SqliteRow) -> AudioRow {
    AudioRow {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        text: row.get("text"),
        audio_url: row.get("audio_url"),
        timestamp_ms: row.get("timestamp_ms"),
        voice_id: row.get("voice_id"),
        voice_name: row.get("voice_name"),
    }
}

/// SQLite-backed row store.
///
/// Uses WAL journal mode and enforces foreign keys, so message and audio rows cannot
/// outlive or precede their conversation. `SqlitePool` is reference-counted and cheap
/// to clone.
#[derive(Clone)]
pub struct SqliteGateway {
    pool: SqlitePool,
}

impl SqliteGateway {
    /// Open (or create) the database at the platform-specific config path.
    pub async fn new() -> RepositoryResult<Self> {
        Self::open(Self::db_path()?).await
    }

    pub async fn open(db_path: impl AsRef<Path>) -> RepositoryResult<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        info!(path = %db_path.display(), "Opened SQLite conversation database");

        Ok(Self { pool })
    }

    /// Create the schema_version table if absent, then apply any pending migrations.
    async fn run_migrations(pool: &SqlitePool) -> RepositoryResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query("INSERT INTO schema_version (version) SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM schema_version)")
            .execute(pool)
            .await?;

        let current: i64 = sqlx::query_scalar("SELECT version FROM schema_version")
            .fetch_one(pool)
            .await?;

        for (version, sql) in MIGRATIONS {
            if *version > current {
                info!(version, "Applying schema migration");
                // One statement per query call
                for statement in sql.split(';') {
                    let trimmed = statement.trim();
                    if !trimmed.is_empty() {
                        sqlx::query(trimmed).execute(pool).await?;
                    }
                }
                sqlx::query("UPDATE schema_version SET version = ?")
                    .bind(version)
                    .execute(pool)
                    .await?;
            }
        }

        Ok(())
    }

    fn db_path() -> RepositoryResult<PathBuf> {
        dirs::config_dir()
            .ok_or_else(|| RepositoryError::InitializationError {
                message: "Cannot find config directory".into(),
            })
            .map(|p| p.join("parla").join("conversations.db"))
    }
}

impl PersistenceGateway for SqliteGateway {
    fn upsert_conversation(&self, row: ConversationRow) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO conversations (id, user_id, title, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    user_id    = excluded.user_id,
                    title      = excluded.title,
                    updated_at = excluded.updated_at",
            )
            .bind(&row.id)
            .bind(&row.user_id)
            .bind(&row.title)
            .bind(to_micros(row.created_at))
            .bind(to_micros(row.updated_at))
            .execute(&pool)
            .await?;

            Ok(())
        })
    }

    fn upsert_messages(&self, rows: Vec<MessageRow>) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let mut tx = pool.begin().await?;

            for row in &rows {
                sqlx::query(
                    "INSERT INTO messages (id, conversation_id, role, content, tool_used, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(id) DO UPDATE SET
                        conversation_id = excluded.conversation_id,
                        role            = excluded.role,
                        content         = excluded.content,
                        tool_used       = excluded.tool_used,
                        created_at      = excluded.created_at",
                )
                .bind(&row.id)
                .bind(&row.conversation_id)
                .bind(row.role.as_str())
                .bind(row.content.to_stored_text())
                .bind(row.tool_used)
                .bind(to_micros(row.created_at))
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            Ok(())
        })
    }

    fn upsert_audio(&self, row: AudioRow) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO audio_entries
                    (id, conversation_id, text, audio_url, timestamp_ms, voice_id, voice_name)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    text         = excluded.text,
                    audio_url    = excluded.audio_url,
                    timestamp_ms = excluded.timestamp_ms,
                    voice_id     = excluded.voice_id,
                    voice_name   = excluded.voice_name",
            )
            .bind(&row.id)
            .bind(&row.conversation_id)
            .bind(&row.text)
            .bind(&row.audio_url)
            .bind(row.timestamp_ms)
            .bind(&row.voice_id)
            .bind(&row.voice_name)
            .execute(&pool)
            .await?;

            Ok(())
        })
    }

    fn delete_conversation(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        let id = id.to_string();
        Box::pin(async move {
            let mut tx = pool.begin().await?;
            sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM audio_entries WHERE conversation_id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM conversations WHERE id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(())
        })
    }

    fn delete_audio(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        let id = id.to_string();
        Box::pin(async move {
            sqlx::query("DELETE FROM audio_entries WHERE id = ?")
                .bind(&id)
                .execute(&pool)
                .await?;
            Ok(())
        })
    }

    fn fetch_conversations(
        &self,
        user_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<ConversationRow>>> {
        let pool = self.pool.clone();
        let user_id = user_id.to_string();
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT id, user_id, title, created_at, updated_at
                 FROM conversations
                 WHERE user_id = ?
                 ORDER BY updated_at DESC, created_at DESC",
            )
            .bind(&user_id)
            .fetch_all(&pool)
            .await?;

            Ok(rows.iter().map(conversation_from_row).collect())
        })
    }

    fn fetch_messages(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<MessageRow>>> {
        let pool = self.pool.clone();
        let conversation_id = conversation_id.to_string();
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT id, conversation_id, role, content, tool_used, created_at
                 FROM messages
                 WHERE conversation_id = ?
                 ORDER BY created_at ASC, rowid ASC",
            )
            .bind(&conversation_id)
            .fetch_all(&pool)
            .await?;

            rows.iter().map(message_from_row).collect()
        })
    }

    fn fetch_audio(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<AudioRow>>> {
        let pool = self.pool.clone();
        let conversation_id = conversation_id.to_string();
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT id, conversation_id, text, audio_url, timestamp_ms, voice_id, voice_name
                 FROM audio_entries
                 WHERE conversation_id = ?
                 ORDER BY timestamp_ms DESC",
            )
            .bind(&conversation_id)
            .fetch_all(&pool)
            .await?;

            Ok(rows.iter().map(audio_from_row).collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::conversation::{ContentPart, ImageUrl};
    use tempfile::tempdir;

    fn at_micros(micros: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_micros(micros).unwrap()
    }

    fn header(id: &str, updated: i64) -> ConversationRow {
        ConversationRow {
            id: id.to_string(),
            user_id: "u1".to_string(),
            title: format!("Title {}", id),
            created_at: at_micros(1_000),
            updated_at: at_micros(updated),
        }
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conversations.db");

        let first = SqliteGateway::open(&path).await.unwrap();
        first.upsert_conversation(header("c1", 5)).await.unwrap();
        drop(first);

        let second = SqliteGateway::open(&path).await.unwrap();
        let version: i64 = sqlx::query_scalar("SELECT version FROM schema_version")
            .fetch_one(&second.pool)
            .await
            .unwrap();
        assert_eq!(version, 1);
        assert_eq!(second.fetch_conversations("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_keeps_created_at_and_orders_by_recency() {
        let dir = tempdir().unwrap();
        let repo = SqliteGateway::open(dir.path().join("c.db")).await.unwrap();

        repo.upsert_conversation(header("a", 10)).await.unwrap();
        repo.upsert_conversation(header("b", 20)).await.unwrap();

        let mut bumped = header("a", 30);
        bumped.created_at = at_micros(99_999);
        repo.upsert_conversation(bumped).await.unwrap();

        let rows = repo.fetch_conversations("u1").await.unwrap();
        assert_eq!(rows[0].id, "a");
        assert_eq!(rows[0].created_at, at_micros(1_000));
        assert_eq!(rows[0].updated_at, at_micros(30));
        assert_eq!(rows[1].id, "b");
    }

    #[tokio::test]
    async fn test_structured_content_round_trips_through_text_column() {
        let dir = tempdir().unwrap();
        let repo = SqliteGateway::open(dir.path().join("c.db")).await.unwrap();
        repo.upsert_conversation(header("c1", 1)).await.unwrap();

        let parts = MessageContent::Parts(vec![
            ContentPart::Text {
                text: "what is this".to_string(),
            },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "data:image/png;base64,AAAA".to_string(),
                },
            },
        ]);
        repo.upsert_messages(vec![
            MessageRow {
                id: "m1".to_string(),
                conversation_id: "c1".to_string(),
                role: Role::User,
                content: parts.clone(),
                tool_used: false,
                created_at: at_micros(10),
            },
            MessageRow {
                id: "m2".to_string(),
                conversation_id: "c1".to_string(),
                role: Role::Assistant,
                content: MessageContent::from("A cat."),
                tool_used: true,
                created_at: at_micros(11),
            },
        ])
        .await
        .unwrap();

        let rows = repo.fetch_messages("c1").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].content, parts);
        assert_eq!(rows[1].role, Role::Assistant);
        assert!(rows[1].tool_used);
    }

    #[tokio::test]
    async fn test_foreign_keys_refuse_orphans() {
        let dir = tempdir().unwrap();
        let repo = SqliteGateway::open(dir.path().join("c.db")).await.unwrap();

        let result = repo
            .upsert_messages(vec![MessageRow {
                id: "m1".to_string(),
                conversation_id: "ghost".to_string(),
                role: Role::User,
                content: MessageContent::from("hi"),
                tool_used: false,
                created_at: at_micros(1),
            }])
            .await;

        assert!(matches!(result, Err(RepositoryError::DatabaseError(_))));
    }

    #[tokio::test]
    async fn test_delete_removes_children() {
        let dir = tempdir().unwrap();
        let repo = SqliteGateway::open(dir.path().join("c.db")).await.unwrap();
        repo.upsert_conversation(header("c1", 1)).await.unwrap();
        repo.upsert_audio(AudioRow {
            id: "a1".to_string(),
            conversation_id: "c1".to_string(),
            text: "hello".to_string(),
            audio_url: "data:audio/mpeg;base64,AAAA".to_string(),
            timestamp_ms: 5,
            voice_id: "v1".to_string(),
            voice_name: "Rachel".to_string(),
        })
        .await
        .unwrap();
        assert_eq!(repo.fetch_audio("c1").await.unwrap().len(), 1);

        repo.delete_conversation("c1").await.unwrap();

        assert!(repo.fetch_conversations("u1").await.unwrap().is_empty());
        assert!(repo.fetch_audio("c1").await.unwrap().is_empty());
    }
}
