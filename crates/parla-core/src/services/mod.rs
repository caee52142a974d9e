pub mod completion_service;
pub mod frame_decoder;
pub mod search_service;
pub mod speech_service;
pub mod title_generator;
pub mod voice_agent_service;

pub use completion_service::{
    ByteStream, ChatMode, CompletionBackend, CompletionError, CompletionRequest,
    HttpCompletionBackend, WireMessage,
};
pub use frame_decoder::{Frame, FrameDecoder, frame_stream};
pub use search_service::{QueryDispatch, SearchError, SearchHit, SearchResponse, SearchService};
pub use speech_service::{AudioClip, CallRecording, RecordingSource, SpeechError, SpeechService, Voice};
pub use title_generator::{UNTITLED, derive_title, title_from_text};
pub use voice_agent_service::{RecordingRetryPolicy, TranscriptSource, VoiceCall, call_entry};
