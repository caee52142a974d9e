pub mod conversation;
pub mod conversations_store;
pub mod persistence_queue;
pub mod stream_manager;

pub use conversation::{
    AudioEntry, ContentPart, Conversation, ImageUrl, Message, MessageContent, Role,
    VOICE_AGENT_ID, VOICE_AGENT_NAME,
};
pub use conversations_store::{ConversationStore, StoreEvent};
pub use persistence_queue::PersistenceQueue;
pub use stream_manager::{FAILURE_REPLY, ReplyAssembler, TurnError, TurnOptions, run_turn};
