use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::repositories::{
    InMemoryGateway, JsonFileGateway, PersistenceGateway, RepositoryResult, RestGateway,
    SqliteGateway,
};
use crate::services::completion_service::ChatMode;
use crate::services::voice_agent_service::RecordingRetryPolicy;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Path error: {0}")]
    PathError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type SettingsResult<T> = Result<T, SettingsError>;

/// Where conversations are mirrored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersistenceBackend {
    /// Nothing survives the process.
    Memory,
    JsonFile {
        #[serde(default)]
        path: Option<PathBuf>,
    },
    Sqlite {
        #[serde(default)]
        path: Option<PathBuf>,
    },
    Remote {
        base_url: String,
        api_key: String,
    },
}

impl Default for PersistenceBackend {
    fn default() -> Self {
        PersistenceBackend::Sqlite { path: None }
    }
}

impl PersistenceBackend {
    /// Open the configured backend. Paths default to the platform config directory.
    pub async fn connect(&self) -> RepositoryResult<Arc<dyn PersistenceGateway>> {
        let gateway: Arc<dyn PersistenceGateway> = match self {
            PersistenceBackend::Memory => Arc::new(InMemoryGateway::new()),
            PersistenceBackend::JsonFile { path: Some(path) } => {
                Arc::new(JsonFileGateway::with_path(path))
            }
            PersistenceBackend::JsonFile { path: None } => Arc::new(JsonFileGateway::new()?),
            PersistenceBackend::Sqlite { path: Some(path) } => {
                Arc::new(SqliteGateway::open(path).await?)
            }
            PersistenceBackend::Sqlite { path: None } => Arc::new(SqliteGateway::new().await?),
            PersistenceBackend::Remote { base_url, api_key } => {
                Arc::new(RestGateway::new(base_url, api_key, None)?)
            }
        };
        debug!(backend = ?self, "Connected persistence backend");
        Ok(gateway)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub completion_url: String,
    pub voice_server_url: String,
    pub search_url: String,
    pub system_prompt: Option<String>,
    pub mode: ChatMode,
    /// Identity used when the host has no sign-in flow of its own.
    pub user_id: Option<String>,
    pub persistence: PersistenceBackend,
    pub recording_retry: RecordingRetryPolicy,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            completion_url: "http://localhost:3001/api/chat".to_string(),
            voice_server_url: "http://localhost:3002".to_string(),
            search_url: "http://localhost:3001/api/search".to_string(),
            system_prompt: None,
            mode: ChatMode::Chat,
            user_id: None,
            persistence: PersistenceBackend::default(),
            recording_retry: RecordingRetryPolicy::default(),
        }
    }
}

/// Client settings stored as pretty JSON in ~/.config/parla/settings.json.
pub struct SettingsRepository {
    file_path: PathBuf,
}

impl SettingsRepository {
    /// Create repository with XDG-compliant path
    pub fn new() -> SettingsResult<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| SettingsError::PathError("Cannot determine config directory".into()))?;

        Ok(Self {
            file_path: config_dir.join("parla").join("settings.json"),
        })
    }

    pub fn with_path(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
        }
    }

    pub async fn load(&self) -> SettingsResult<ClientSettings> {
        let contents = match tokio::fs::read_to_string(&self.file_path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.file_path.display(), "No settings file, using defaults");
                return Ok(ClientSettings::default());
            }
            Err(e) => return Err(e.into()),
        };

        Ok(serde_json::from_str(&contents)?)
    }

    pub async fn save(&self, settings: &ClientSettings) -> SettingsResult<()> {
        let json = serde_json::to_string_pretty(settings)?;

        if let Some(parent) = self.file_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write atomically using temp file + rename
        let temp_path = self.file_path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, &json).await?;
        tokio::fs::rename(&temp_path, &self.file_path).await?;

        info!(path = %self.file_path.display(), "Saved settings");
        Ok(())
    }
}
