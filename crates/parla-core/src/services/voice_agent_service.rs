use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::speech_service::{CallRecording, RecordingSource};
use super::title_generator::{NO_AUDIO_SUFFIX, voice_call_title};
use crate::models::conversation::{AudioEntry, Message, Role, VOICE_AGENT_ID, VOICE_AGENT_NAME};
use crate::models::conversations_store::ConversationStore;

/// How long to wait for the voice server to publish a finished call's recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingRetryPolicy {
    pub initial_delay_ms: u64,
    pub attempts: u32,
    pub interval_ms: u64,
}

impl Default for RecordingRetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 5000,
            attempts: 5,
            interval_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptSource {
    Agent,
    User,
}

/// A live voice-agent call bound to the conversation it records into.
pub struct VoiceCall {
    store: ConversationStore,
    conversation_id: String,
    call_id: Option<String>,
    started_at: Instant,
}

impl VoiceCall {
    /// Create and select a fresh conversation for the call.
    pub fn start(store: &ConversationStore) -> Self {
        let conversation_id = store.create_conversation();
        info!(conversation_id = %conversation_id, "Voice call started");

        Self {
            store: store.clone(),
            conversation_id,
            call_id: None,
            started_at: Instant::now(),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Remember the voice server's id for this call; needed to fetch the recording.
    pub fn set_call_id(&mut self, call_id: impl Into<String>) {
        self.call_id = Some(call_id.into());
    }

    pub fn record_transcript(&self, source: TranscriptSource, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let role = match source {
            TranscriptSource::Agent => Role::Assistant,
            TranscriptSource::User => Role::User,
        };
        self.store
            .append_message(Message::new(role, text), Some(&self.conversation_id));
    }

    /// End the call and attach its recording (or a no-audio marker) to the conversation.
    pub async fn finish(
        self,
        source: &dyn RecordingSource,
        policy: &RecordingRetryPolicy,
    ) -> AudioEntry {
        let duration = self.started_at.elapsed();

        let recording = match &self.call_id {
            Some(call_id) => fetch_with_retry(source, call_id, policy).await,
            None => {
                warn!(
                    conversation_id = %self.conversation_id,
                    "Voice call ended without a call id, saving without audio"
                );
                None
            }
        };

        let entry = call_entry(duration, recording);
        self.store
            .add_audio_entry(entry.clone(), Some(&self.conversation_id));
        entry
    }
}

async fn fetch_with_retry(
    source: &dyn RecordingSource,
    call_id: &str,
    policy: &RecordingRetryPolicy,
) -> Option<CallRecording> {
    tokio::time::sleep(Duration::from_millis(policy.initial_delay_ms)).await;

    for attempt in 0..policy.attempts {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(policy.interval_ms)).await;
        }

        match source.fetch_recording(call_id).await {
            Ok(Some(recording)) => return Some(recording),
            Ok(None) => debug!(call_id, attempt, "Recording not available yet"),
            Err(e) => warn!(call_id, attempt, error = ?e, "Failed to fetch call recording"),
        }
    }

    warn!(call_id, attempts = policy.attempts, "Giving up on call recording");
    None
}

/// Audio entry describing a finished call.
pub fn call_entry(duration: Duration, recording: Option<CallRecording>) -> AudioEntry {
    match recording {
        Some(recording) => {
            let text = recording
                .transcription
                .unwrap_or_else(|| voice_call_title(duration));
            AudioEntry::new(
                text,
                recording.clip.to_data_uri(),
                VOICE_AGENT_ID,
                VOICE_AGENT_NAME,
            )
        }
        None => AudioEntry::new(
            format!("{}{}", voice_call_title(duration), NO_AUDIO_SUFFIX),
            "",
            VOICE_AGENT_ID,
            VOICE_AGENT_NAME,
        ),
    }
}
