use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::models::conversation::AudioEntry;
use crate::repositories::BoxFuture;

const DEFAULT_AUDIO_MIME: &str = "audio/mpeg";
const TRANSCRIPTION_HEADER: &str = "X-Transcription";

#[derive(Debug, Error)]
pub enum SpeechError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Voice server returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid speech request: {0}")]
    InvalidRequest(&'static str),
}

pub type SpeechResult<T> = Result<T, SpeechError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voice {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub preview_url: String,
}

/// Binary audio as returned by the voice server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl AudioClip {
    /// Self-contained `data:` URI, safe to persist.
    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, STANDARD.encode(&self.bytes))
    }
}

/// Recorded audio of a finished voice-agent call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecording {
    pub clip: AudioClip,
    /// Transcript header supplied alongside the audio, when the server has one.
    pub transcription: Option<String>,
}

/// Source of voice-agent call recordings.
///
/// `Ok(None)` means the recording is not available yet and the caller may retry.
pub trait RecordingSource: Send + Sync {
    fn fetch_recording(&self, call_id: &str) -> BoxFuture<'static, SpeechResult<Option<CallRecording>>>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeakRequest<'a> {
    text: &'a str,
    voice_id: &'a str,
}

/// Client for the voice server: voice listing, text-to-speech and call recordings.
#[derive(Clone)]
pub struct SpeechService {
    client: reqwest::Client,
    base_url: String,
}

impl SpeechService {
    pub fn new(base_url: &str) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn ensure_success(response: reqwest::Response) -> SpeechResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(SpeechError::Status {
            status: status.as_u16(),
            body,
        })
    }

    fn mime_of(response: &reqwest::Response) -> Option<String> {
        response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
    }

    pub async fn list_voices(&self) -> SpeechResult<Vec<Voice>> {
        let response = self.client.get(self.url("/api/voices")).send().await?;
        let response = Self::ensure_success(response).await?;
        let voices: Vec<Voice> = response.json().await?;
        debug!(count = voices.len(), "Fetched voices");
        Ok(voices)
    }

    pub async fn synthesize(&self, text: &str, voice_id: &str) -> SpeechResult<AudioClip> {
        if text.trim().is_empty() {
            return Err(SpeechError::InvalidRequest("text is empty"));
        }
        if voice_id.trim().is_empty() {
            return Err(SpeechError::InvalidRequest("voice id is empty"));
        }

        let response = self
            .client
            .post(self.url("/api/speak"))
            .json(&SpeakRequest { text, voice_id })
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;

        let mime_type = Self::mime_of(&response).unwrap_or_else(|| DEFAULT_AUDIO_MIME.to_string());
        let bytes = response.bytes().await?.to_vec();
        info!(voice_id, bytes = bytes.len(), "Synthesized speech");

        Ok(AudioClip { mime_type, bytes })
    }

    /// Synthesize `text` and wrap it as an audio entry ready for the store.
    pub async fn speech_entry(&self, text: &str, voice: &Voice) -> SpeechResult<AudioEntry> {
        let clip = self.synthesize(text, &voice.id).await?;
        Ok(AudioEntry::new(
            text,
            clip.to_data_uri(),
            voice.id.as_str(),
            voice.name.as_str(),
        ))
    }
}

impl RecordingSource for SpeechService {
    fn fetch_recording(&self, call_id: &str) -> BoxFuture<'static, SpeechResult<Option<CallRecording>>> {
        let client = self.client.clone();
        let url = self.url(&format!("/api/conversation-audio/{}", call_id));

        Box::pin(async move {
            let response = client.get(&url).send().await?;
            if !response.status().is_success() {
                debug!(status = response.status().as_u16(), "Call recording not ready");
                return Ok(None);
            }

            // The server answers with a JSON status body until the audio exists
            let mime_type = match Self::mime_of(&response) {
                Some(mime) if mime.contains("audio") => mime,
                _ => return Ok(None),
            };

            let transcription = response
                .headers()
                .get(TRANSCRIPTION_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string);

            let bytes = response.bytes().await?.to_vec();
            Ok(Some(CallRecording {
                clip: AudioClip { mime_type, bytes },
                transcription,
            }))
        })
    }
}
