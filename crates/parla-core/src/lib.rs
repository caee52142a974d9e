//! Conversation state and streaming synchronization engine for the Parla chat client.
//!
//! The [`ConversationStore`] owns the in-memory model of conversations, messages and audio
//! entries. Assistant replies are assembled from a chunked completion stream by
//! [`models::stream_manager`], and every mutation is mirrored best-effort to a
//! [`PersistenceGateway`] backend.

pub mod identity;
pub mod models;
pub mod repositories;
pub mod services;
pub mod settings;

pub use identity::{Identity, IdentityProvider};
pub use models::{
    AudioEntry, ContentPart, Conversation, ConversationStore, Message, MessageContent, Role,
    StoreEvent,
};
pub use repositories::{PersistenceGateway, RepositoryError, RepositoryResult};
pub use settings::{ClientSettings, PersistenceBackend, SettingsRepository};
