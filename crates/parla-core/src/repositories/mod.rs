pub mod error;
pub mod in_memory_repository;
pub mod json_file_repository;
pub mod persistence_gateway;
pub mod rest_repository;
pub mod sqlite_repository;

pub use error::{RepositoryError, RepositoryResult};
pub use in_memory_repository::{InMemoryGateway, StoreSnapshot};
pub use json_file_repository::JsonFileGateway;
pub use persistence_gateway::{AudioRow, BoxFuture, ConversationRow, MessageRow, PersistenceGateway};
pub use rest_repository::RestGateway;
pub use sqlite_repository::SqliteGateway;
