use thiserror::Error;

#[derive(Debug, Error)]
#[allow(clippy::enum_variant_names)]
pub enum RepositoryError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Repository initialization failed: {message}")]
    InitializationError { message: String },

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Remote store rejected {operation} with status {status}: {body}")]
    StatusError {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    #[error("Persistence worker is no longer running")]
    WorkerStopped,
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;
