use std::cmp::Ordering;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::services::title_generator::{UNTITLED, is_provisional_title};

/// Voice id carried by audio produced by the voice agent rather than text-to-speech.
pub const VOICE_AGENT_ID: &str = "conversational-ai";
pub const VOICE_AGENT_NAME: &str = "Voice Agent";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// One typed part of a structured message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

/// Message body: plain text or an ordered list of typed parts. Serialized untagged so the
/// wire form is either a JSON string or a JSON array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// The plain text, or the text of the first text part.
    pub fn first_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(text) => Some(text),
            MessageContent::Parts(parts) => parts.iter().find_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::ImageUrl { .. } => None,
            }),
        }
    }

    /// Decode content read back from a text column.
    ///
    /// Text that looks like a JSON array or object and decodes as parts becomes structured
    /// content; anything else stays plain text.
    pub fn from_stored_text(raw: &str) -> Self {
        let trimmed = raw.trim();
        let looks_structured = (trimmed.starts_with('[') && trimmed.ends_with(']'))
            || (trimmed.starts_with('{') && trimmed.ends_with('}'));

        if looks_structured {
            if let Ok(parts) = serde_json::from_str::<Vec<ContentPart>>(trimmed) {
                return MessageContent::Parts(parts);
            }
            if let Ok(part) = serde_json::from_str::<ContentPart>(trimmed) {
                return MessageContent::Parts(vec![part]);
            }
            tracing::debug!("Stored content looks like JSON but is not structured content");
        }

        MessageContent::Text(raw.to_string())
    }

    /// Encode content for a text column. Inverse of [`MessageContent::from_stored_text`].
    pub fn to_stored_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => {
                serde_json::to_string(parts).unwrap_or_else(|_| String::from("[]"))
            }
        }
    }

    /// Re-run stored-text decoding on plain text values.
    pub fn normalized(self) -> Self {
        match self {
            MessageContent::Text(text) => MessageContent::from_stored_text(&text),
            parts => parts,
        }
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        MessageContent::Text(text.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        MessageContent::Text(text)
    }
}

impl From<Vec<ContentPart>> for MessageContent {
    fn from(parts: Vec<ContentPart>) -> Self {
        MessageContent::Parts(parts)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tool_used: bool,
}

impl Message {
    /// New message with a fresh client-side id, stamped now.
    pub fn new(role: Role, content: impl Into<MessageContent>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), role, content)
    }

    pub fn with_id(id: impl Into<String>, role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_used: false,
        }
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Empty assistant message answering `prompt`. Its timestamp sorts strictly after the
    /// prompt's even when the clock has not advanced.
    pub fn reply_placeholder(prompt: &Message) -> Self {
        let mut reply = Self::assistant("");
        let floor = prompt.timestamp + Duration::milliseconds(1);
        if reply.timestamp < floor {
            reply.timestamp = floor;
        }
        reply
    }

    pub fn text(&self) -> Option<&str> {
        self.content.first_text()
    }
}

/// Replace the message with the same id, or append it.
pub fn upsert_message(messages: &mut Vec<Message>, message: Message) {
    match messages.iter_mut().find(|existing| existing.id == message.id) {
        Some(existing) => *existing = message,
        None => messages.push(message),
    }
}

/// A generated or recorded audio clip attached to a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioEntry {
    pub id: String,
    /// Source text for speech, or the call transcript header for voice-agent audio.
    pub text: String,
    /// A self-contained `data:` URI, or empty when no audio could be retrieved.
    pub audio_uri: String,
    pub timestamp: DateTime<Utc>,
    pub voice_id: String,
    pub voice_name: String,
}

impl AudioEntry {
    pub fn new(
        text: impl Into<String>,
        audio_uri: impl Into<String>,
        voice_id: impl Into<String>,
        voice_name: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            audio_uri: audio_uri.into(),
            timestamp: Utc::now(),
            voice_id: voice_id.into(),
            voice_name: voice_name.into(),
        }
    }

    pub fn is_voice_agent(&self) -> bool {
        self.voice_id == VOICE_AGENT_ID
    }
}

/// A titled conversation with its materialized messages and audio entries.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub(crate) id: String,
    pub(crate) title: String,
    pub(crate) messages: Vec<Message>,
    /// Most recent first.
    pub(crate) audio_entries: Vec<AudioEntry>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
    /// Set by an explicit rename; content never retitles a pinned conversation.
    pub(crate) title_pinned: bool,
}

impl Conversation {
    /// Empty conversation carrying the untitled sentinel.
    pub fn new(id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            title: UNTITLED.to_string(),
            messages: Vec::new(),
            audio_entries: Vec::new(),
            created_at,
            updated_at: created_at,
            title_pinned: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Whether messages or audio may still replace the title.
    pub fn title_is_provisional(&self) -> bool {
        !self.title_pinned && is_provisional_title(&self.title)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn audio_entries(&self) -> &[AudioEntry] {
        &self.audio_entries
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.audio_entries.is_empty()
    }

    /// Audio entries but no messages.
    pub fn has_only_audio(&self) -> bool {
        self.messages.is_empty() && !self.audio_entries.is_empty()
    }

    pub fn contains_message(&self, message_id: &str) -> bool {
        self.messages.iter().any(|message| message.id == message_id)
    }

    pub fn contains_audio(&self, audio_id: &str) -> bool {
        self.audio_entries.iter().any(|audio| audio.id == audio_id)
    }
}

/// Listing order: `updated_at` descending, ties broken by `created_at` descending.
pub fn recency_order(a: &Conversation, b: &Conversation) -> Ordering {
    b.updated_at
        .cmp(&a.updated_at)
        .then_with(|| b.created_at.cmp(&a.created_at))
}

pub fn sort_by_recency(conversations: &mut [Conversation]) {
    conversations.sort_by(recency_order);
}
