use futures::StreamExt;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::conversation::{Message, MessageContent, upsert_message};
use super::conversations_store::{ConversationStore, StoreEvent};
use crate::services::completion_service::{ChatMode, CompletionBackend, CompletionRequest};
use crate::services::frame_decoder::{Frame, frame_stream};

/// Reply committed in place of the assistant's answer when the stream fails.
pub const FAILURE_REPLY: &str =
    "Sorry, there was an error processing your request. Please try again.";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnOptions {
    pub system_prompt: Option<String>,
    pub mode: Option<ChatMode>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TurnError {
    #[error("A reply is already streaming into conversation {conversation_id}")]
    AlreadyStreaming { conversation_id: String },
}

/// Send one user message and stream the assistant's reply.
///
/// Runs in the current conversation, or a new one when none is selected. At most one reply
/// streams per conversation. Backend failures do not surface as errors: the reply is
/// committed as [`FAILURE_REPLY`] instead.
pub async fn run_turn(
    store: &ConversationStore,
    backend: &dyn CompletionBackend,
    content: impl Into<MessageContent>,
    options: &TurnOptions,
) -> Result<Message, TurnError> {
    let conversation_id = match store.current_id() {
        Some(id) => id,
        None => store.create_conversation(),
    };

    if !store.begin_stream(&conversation_id) {
        return Err(TurnError::AlreadyStreaming { conversation_id });
    }

    let prompt = Message::user(content);
    store.append_message(prompt.clone(), Some(&conversation_id));

    let history = store.messages_of(&conversation_id);
    let request = CompletionRequest::from_history(
        &history,
        options.system_prompt.as_deref(),
        options.mode,
    );

    let reply = ReplyAssembler::new(store.clone(), conversation_id.clone(), &prompt)
        .run(backend, request)
        .await;

    store.end_stream(&conversation_id);
    Ok(reply)
}

/// Builds one assistant reply from decoded frames.
///
/// The reply is pinned to the conversation it was started in. Each delta is shown only
/// while that conversation is displayed; the finished reply is always committed to it.
pub struct ReplyAssembler {
    store: ConversationStore,
    conversation_id: String,
    reply: Message,
    text: String,
    done: bool,
}

impl ReplyAssembler {
    pub fn new(store: ConversationStore, conversation_id: String, prompt: &Message) -> Self {
        Self {
            store,
            conversation_id,
            reply: Message::reply_placeholder(prompt),
            text: String::new(),
            done: false,
        }
    }

    pub fn reply(&self) -> &Message {
        &self.reply
    }

    /// Drive the whole stream, then commit. Returns the committed reply.
    pub async fn run(mut self, backend: &dyn CompletionBackend, request: CompletionRequest) -> Message {
        self.show();

        match backend.open(request).await {
            Ok(body) => {
                // Drained to EOF; frames after the sentinel are dropped by `apply`
                let mut frames = frame_stream(body);
                while let Some(frame) = frames.next().await {
                    match frame {
                        Ok(frame) => self.apply(frame),
                        Err(e) if self.done => {
                            debug!(conversation_id = %self.conversation_id, error = ?e, "Stream failed after the end sentinel, keeping reply");
                            break;
                        }
                        Err(e) => {
                            warn!(conversation_id = %self.conversation_id, error = ?e, "Completion stream failed");
                            self.fail();
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(conversation_id = %self.conversation_id, error = ?e, "Failed to open completion stream");
                self.fail();
            }
        }

        self.commit()
    }

    /// Apply one frame. Frames after the end sentinel are ignored.
    pub fn apply(&mut self, frame: Frame) {
        if self.done {
            return;
        }

        match frame {
            Frame::Content(delta) => {
                self.text.push_str(&delta);
                self.reply.content = MessageContent::Text(self.text.clone());
                self.show();
                self.store.publish(StoreEvent::ReplyDelta {
                    conversation_id: self.conversation_id.clone(),
                    message_id: self.reply.id.clone(),
                    delta,
                });
            }
            Frame::ToolCall => {
                debug!(conversation_id = %self.conversation_id, "Reply used a tool");
                self.reply.tool_used = true;
            }
            Frame::Done => self.done = true,
        }
    }

    /// Replace whatever arrived with the generic failure reply.
    pub fn fail(&mut self) {
        self.text = FAILURE_REPLY.to_string();
        self.reply.content = MessageContent::from(FAILURE_REPLY);
        self.done = true;
    }

    /// Put the reply into the display if its conversation is the one shown.
    fn show(&self) -> bool {
        let reply = self.reply.clone();
        self.store
            .replace_messages_for(&self.conversation_id, move |messages| {
                let mut next = messages.to_vec();
                upsert_message(&mut next, reply);
                next
            })
    }

    /// Final display update plus a durable save of the conversation with the reply.
    pub fn commit(self) -> Message {
        self.show();

        let mut messages = self.store.messages_of(&self.conversation_id);
        upsert_message(&mut messages, self.reply.clone());
        self.store.save_conversation(&self.conversation_id, messages);

        info!(
            conversation_id = %self.conversation_id,
            chars = self.text.chars().count(),
            tool_used = self.reply.tool_used,
            "Reply committed"
        );
        self.reply
    }
}
