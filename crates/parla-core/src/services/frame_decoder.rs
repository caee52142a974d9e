use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Deserialize;
use tracing::{debug, warn};

use super::completion_service::{ByteStream, CompletionError};

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

/// One decoded frame of the completion stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Content(String),
    ToolCall,
    Done,
}

#[derive(Debug, Deserialize)]
struct FramePayload {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calling: bool,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// Decode a single line. Returns `None` for anything that is not a usable data frame.
pub fn parse_frame_line(line: &str) -> Option<Frame> {
    let payload = line.strip_prefix(DATA_PREFIX)?;
    let payload = payload.strip_prefix(' ').unwrap_or(payload).trim_end();

    if payload == DONE_SENTINEL {
        return Some(Frame::Done);
    }

    let parsed: FramePayload = match serde_json::from_str(payload) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(error = %e, "Skipping malformed stream frame");
            return None;
        }
    };

    if let Some(error) = parsed.error {
        warn!(error = %error, "Completion backend reported an error frame");
        return None;
    }

    if parsed.tool_calling {
        return Some(Frame::ToolCall);
    }

    parsed
        .content
        .filter(|content| !content.is_empty())
        .map(Frame::Content)
}

/// Incremental line splitter over raw bytes.
///
/// Lines are split on the byte `\n` before any UTF-8 decoding. A newline byte never occurs
/// inside a multi-byte sequence, so characters split across chunks are reassembled intact.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.pending.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            if let Some(frame) = Self::decode_line(&line[..line.len() - 1]) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Decode whatever is left once the byte stream has ended without a final newline.
    pub fn finish(&mut self) -> Option<Frame> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        Self::decode_line(&line)
    }

    fn decode_line(bytes: &[u8]) -> Option<Frame> {
        let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
        if bytes.is_empty() {
            return None;
        }
        parse_frame_line(&String::from_utf8_lossy(bytes))
    }
}

/// Turn a raw response body into a stream of frames.
///
/// Transport errors are passed through; a trailing partial line is decoded at EOF.
pub fn frame_stream(mut bytes: ByteStream) -> BoxStream<'static, Result<Frame, CompletionError>> {
    Box::pin(async_stream::stream! {
        let mut decoder = FrameDecoder::new();

        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    for frame in decoder.push(&chunk) {
                        yield Ok(frame);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        if let Some(frame) = decoder.finish() {
            yield Ok(frame);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[test]
    fn test_parse_content_and_sentinel() {
        assert_eq!(
            parse_frame_line(r#"data: {"content":"Hel"}"#),
            Some(Frame::Content("Hel".to_string()))
        );
        assert_eq!(
            parse_frame_line(r#"data:{"content":"lo"}"#),
            Some(Frame::Content("lo".to_string()))
        );
        assert_eq!(parse_frame_line("data: [DONE]"), Some(Frame::Done));
        assert_eq!(
            parse_frame_line(r#"data: {"tool_calling":true}"#),
            Some(Frame::ToolCall)
        );
    }

    #[test]
    fn test_unusable_lines_are_skipped() {
        assert_eq!(parse_frame_line(": keep-alive"), None);
        assert_eq!(parse_frame_line("event: message"), None);
        assert_eq!(parse_frame_line(r#"data: {"content":"#), None);
        assert_eq!(parse_frame_line(r#"data: {"content":""}"#), None);
        assert_eq!(parse_frame_line(r#"data: {"error":"quota exceeded"}"#), None);
    }

    #[test]
    fn test_split_multibyte_character() {
        let line = "data: {\"content\":\"¡olé 😀\"}\n".as_bytes();
        // Split in the middle of the emoji
        let emoji_start = line.iter().position(|b| *b == 0xF0).unwrap();
        let (head, tail) = line.split_at(emoji_start + 2);

        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(head).is_empty());
        assert_eq!(
            decoder.push(tail),
            vec![Frame::Content("¡olé 😀".to_string())]
        );
    }

    #[test]
    fn test_crlf_and_blank_lines() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"data: {\"content\":\"a\"}\r\n\r\ndata: [DONE]\r\n");
        assert_eq!(
            frames,
            vec![Frame::Content("a".to_string()), Frame::Done]
        );
    }

    #[test]
    fn test_finish_flushes_partial_line() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"data: {\"content\":\"tail\"}").is_empty());
        assert_eq!(decoder.finish(), Some(Frame::Content("tail".to_string())));
        assert_eq!(decoder.finish(), None);
    }

    #[tokio::test]
    async fn test_frame_stream_across_chunks() {
        let chunks: Vec<Result<Vec<u8>, CompletionError>> = vec![
            Ok(b"data: {\"conte".to_vec()),
            Ok(b"nt\":\"Hel\"}\ndata: not json\n".to_vec()),
            Ok(b"data: {\"content\":\"lo\"}\ndata: [DONE]\n".to_vec()),
        ];
        let frames: Vec<Frame> = frame_stream(Box::pin(stream::iter(chunks)))
            .map(|frame| frame.unwrap())
            .collect()
            .await;

        assert_eq!(
            frames,
            vec![
                Frame::Content("Hel".to_string()),
                Frame::Content("lo".to_string()),
                Frame::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_frame_stream_passes_transport_error() {
        let chunks: Vec<Result<Vec<u8>, CompletionError>> = vec![
            Ok(b"data: {\"content\":\"a\"}\n".to_vec()),
            Err(CompletionError::Stream("connection reset".to_string())),
            Ok(b"data: {\"content\":\"never\"}\n".to_vec()),
        ];
        let frames: Vec<Result<Frame, CompletionError>> =
            frame_stream(Box::pin(stream::iter(chunks))).collect().await;

        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[1], Err(CompletionError::Stream(_))));
    }
}
