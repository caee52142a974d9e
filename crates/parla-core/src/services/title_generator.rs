use std::time::Duration;

use crate::models::conversation::{Message, Role};

/// Title every conversation starts with until content decides a real one.
pub const UNTITLED: &str = "New conversation";

/// Prefix of the placeholder titles given to voice-agent calls.
pub const VOICE_TITLE_PREFIX: &str = "Voice conversation";

/// Appended to a voice-call placeholder when the call's recording never arrived.
pub const NO_AUDIO_SUFFIX: &str = " (no audio)";

const DURATION_LABEL: &str = " - Duration: ";

pub const TITLE_MAX_CHARS: usize = 50;

const ELLIPSIS: &str = "...";

/// Cut `text` to [`TITLE_MAX_CHARS`] characters, marking the cut with an ellipsis.
pub fn truncate_title(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(TITLE_MAX_CHARS).collect();

    if chars.next().is_some() {
        format!("{}{}", head, ELLIPSIS)
    } else {
        head
    }
}

/// Title from free text, falling back to [`UNTITLED`] when there is nothing to show.
pub fn title_from_text(text: &str) -> String {
    if text.trim().is_empty() {
        UNTITLED.to_string()
    } else {
        truncate_title(text)
    }
}

/// Derive a title from the first user-authored message.
///
/// Assistant messages are ignored. Structured bodies contribute their first text part.
/// Returns [`UNTITLED`] when no user message carries text.
pub fn derive_title(messages: &[Message]) -> String {
    messages
        .iter()
        .find(|message| message.role == Role::User)
        .and_then(|message| message.content.first_text())
        .map(title_from_text)
        .unwrap_or_else(|| UNTITLED.to_string())
}

/// Whether `title` was generated rather than chosen, so content may still replace it.
///
/// Only [`UNTITLED`] and the exact shapes produced by [`voice_call_title`] qualify.
pub fn is_provisional_title(title: &str) -> bool {
    title == UNTITLED || is_voice_call_title(title)
}

fn is_voice_call_title(title: &str) -> bool {
    let Some(duration) = title
        .strip_prefix(VOICE_TITLE_PREFIX)
        .and_then(|rest| rest.strip_prefix(DURATION_LABEL))
    else {
        return false;
    };
    let duration = duration.strip_suffix(NO_AUDIO_SUFFIX).unwrap_or(duration);

    match duration.split_once(':') {
        Some((minutes, seconds)) => {
            !minutes.is_empty()
                && minutes.bytes().all(|b| b.is_ascii_digit())
                && seconds.len() == 2
                && seconds.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

/// Placeholder text for a finished voice call, e.g. `Voice conversation - Duration: 1:05`.
pub fn voice_call_title(duration: Duration) -> String {
    let seconds = duration.as_secs();
    format!(
        "{}{}{}:{:02}",
        VOICE_TITLE_PREFIX,
        DURATION_LABEL,
        seconds / 60,
        seconds % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::conversation::{ContentPart, ImageUrl, MessageContent};

    #[test]
    fn test_empty_history_is_untitled() {
        assert_eq!(derive_title(&[]), UNTITLED);
    }

    #[test]
    fn test_skips_assistant_and_truncates() {
        let question = "What is 2+2? Please explain in detail, step by step, with examples.";
        let messages = vec![
            Message::assistant("hello"),
            Message::user(question),
        ];

        let title = derive_title(&messages);
        assert!(title.ends_with("..."));
        assert!(title.starts_with("What is 2+2?"));
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + 3);
        assert!(!title.contains("hello"));
    }

    #[test]
    fn test_short_text_kept_whole() {
        let messages = vec![Message::user("Plan a trip to Lisbon")];
        assert_eq!(derive_title(&messages), "Plan a trip to Lisbon");
    }

    #[test]
    fn test_exact_limit_not_marked() {
        let text = "x".repeat(TITLE_MAX_CHARS);
        assert_eq!(truncate_title(&text), text);
    }

    #[test]
    fn test_truncates_on_char_boundaries() {
        let text = "ñ".repeat(TITLE_MAX_CHARS + 5);
        let title = truncate_title(&text);
        assert_eq!(title, format!("{}...", "ñ".repeat(TITLE_MAX_CHARS)));
    }

    #[test]
    fn test_structured_content_uses_text_part() {
        let content = MessageContent::Parts(vec![
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "data:image/png;base64,AAAA".to_string(),
                },
            },
            ContentPart::Text {
                text: "Describe this picture".to_string(),
            },
        ]);
        let messages = vec![Message::user(content)];
        assert_eq!(derive_title(&messages), "Describe this picture");
    }

    #[test]
    fn test_image_only_message_is_untitled() {
        let content = MessageContent::Parts(vec![ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: "https://example.com/a.png".to_string(),
            },
        }]);
        assert_eq!(derive_title(&[Message::user(content)]), UNTITLED);
        assert_eq!(derive_title(&[Message::user("   ")]), UNTITLED);
    }

    #[test]
    fn test_provisional_titles() {
        assert!(is_provisional_title(UNTITLED));
        assert!(is_provisional_title(&voice_call_title(Duration::from_secs(65))));
        assert!(!is_provisional_title("Trip planning"));
    }

    #[test]
    fn test_voice_placeholder_needs_exact_shape() {
        let no_audio = format!("{}{}", voice_call_title(Duration::from_secs(3600)), NO_AUDIO_SUFFIX);
        assert_eq!(no_audio, "Voice conversation - Duration: 60:00 (no audio)");
        assert!(is_provisional_title(&no_audio));

        assert!(!is_provisional_title("Voice conversation notes"));
        assert!(!is_provisional_title(VOICE_TITLE_PREFIX));
        assert!(!is_provisional_title("Voice conversation - Duration: 1:5"));
        assert!(!is_provisional_title("Voice conversation - Duration: 1:05 with Ana"));
        assert!(!is_provisional_title("Voice conversation - Duration: :05"));
    }

    #[test]
    fn test_voice_call_title_format() {
        assert_eq!(
            voice_call_title(Duration::from_secs(65)),
            "Voice conversation - Duration: 1:05"
        );
        assert_eq!(
            voice_call_title(Duration::from_secs(9)),
            "Voice conversation - Duration: 0:09"
        );
    }
}
