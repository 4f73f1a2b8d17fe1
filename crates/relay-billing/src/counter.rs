//! Token estimation.
//!
//! The relay only needs prompt estimates good enough to size a reservation
//! and a completion fallback when an upstream reports no usage. Latin text is
//! counted at roughly four characters per token, CJK ideographs and kana at
//! one token each.

use relay_core::{ChatMessage, RelayError, RelayResult, TokenCounter};

/// Tokens added per chat message for the role framing
const TOKENS_PER_MESSAGE: u32 = 3;
/// Tokens added when a message carries a name
const TOKENS_PER_NAME: u32 = 1;
/// Every reply is primed with the assistant header
const REPLY_PRIMING: u32 = 3;

/// Character-class token estimator
#[derive(Debug, Default, Clone, Copy)]
pub struct EstimatingTokenCounter;

impl EstimatingTokenCounter {
    /// Create a counter
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn estimate(text: &str) -> u32 {
        let mut wide = 0u32;
        let mut narrow = 0u32;
        for ch in text.chars() {
            if is_wide(ch) {
                wide += 1;
            } else {
                narrow += 1;
            }
        }
        wide + narrow.div_ceil(4)
    }
}

fn is_wide(ch: char) -> bool {
    matches!(ch as u32,
        0x3040..=0x30FF      // kana
        | 0x3400..=0x4DBF    // CJK extension A
        | 0x4E00..=0x9FFF    // CJK unified
        | 0xAC00..=0xD7AF    // hangul
        | 0xF900..=0xFAFF    // CJK compatibility
        | 0x20000..=0x2FA1F) // CJK extensions B-F
}

impl TokenCounter for EstimatingTokenCounter {
    fn count_messages(&self, messages: &[ChatMessage], _model: &str) -> u32 {
        let mut total = 0;
        for message in messages {
            total += TOKENS_PER_MESSAGE;
            total += Self::estimate(&message.text_content());
            total += Self::estimate(message.role.as_str());
            if let Some(name) = &message.name {
                total += TOKENS_PER_NAME + Self::estimate(name);
            }
        }
        total + REPLY_PRIMING
    }

    fn count_text(&self, text: &str, _model: &str) -> u32 {
        Self::estimate(text)
    }
}

/// Token-equivalents reserved for an image request.
///
/// DALL·E sizes carry the upstream price multipliers; other models count 1000
/// per image. An unsupported DALL·E size is a caller error.
pub fn image_tokens(model: &str, size: Option<&str>, quality: Option<&str>, n: u32) -> RelayResult<u32> {
    let size = size.unwrap_or("1024x1024");
    let ratio = match model {
        "dall-e-2" => match size {
            "256x256" => 1.0,
            "512x512" => 1.125,
            "1024x1024" => 1.25,
            _ => return Err(unsupported_size(model, size)),
        },
        "dall-e-3" => {
            let base = match size {
                "1024x1024" => 1.0,
                "1024x1792" | "1792x1024" => 2.0,
                _ => return Err(unsupported_size(model, size)),
            };
            match (quality, size) {
                (Some("hd"), "1024x1024") => base * 2.0,
                (Some("hd"), _) => base * 1.5,
                _ => base,
            }
        }
        _ => 1.0,
    };
    let per_image = (ratio * 1000.0_f64).round();
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let per_image = per_image as u32;
    Ok(per_image.saturating_mul(n.max(1)))
}

fn unsupported_size(model: &str, size: &str) -> RelayError {
    RelayError::validation(
        format!("size {size} is not supported for {model}"),
        Some("size".to_string()),
        "invalid_size",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_estimate() {
        let counter = EstimatingTokenCounter::new();
        assert_eq!(counter.count_text("", "gpt-4"), 0);
        assert_eq!(counter.count_text("abcd", "gpt-4"), 1);
        assert_eq!(counter.count_text("hello world", "gpt-4"), 3);
        assert_eq!(counter.count_text("你好", "gpt-4"), 2);
        assert_eq!(counter.count_text("你好 ab", "gpt-4"), 3);
    }

    #[test]
    fn test_message_framing() {
        let counter = EstimatingTokenCounter::new();
        let messages = vec![ChatMessage::system("be brief"), ChatMessage::user("hi")];
        // system: 3 + 2 + 2, user: 3 + 1 + 1, priming 3
        assert_eq!(counter.count_messages(&messages, "gpt-4"), 15);
    }

    #[test]
    fn test_image_tokens() {
        assert_eq!(image_tokens("dall-e-2", Some("512x512"), None, 2).unwrap(), 2250);
        assert_eq!(image_tokens("dall-e-3", Some("1024x1792"), Some("hd"), 1).unwrap(), 3000);
        assert_eq!(image_tokens("dall-e-3", None, Some("hd"), 1).unwrap(), 2000);
        assert_eq!(image_tokens("cogview-3", None, None, 3).unwrap(), 3000);
        assert!(matches!(
            image_tokens("dall-e-3", Some("256x256"), None, 1),
            Err(RelayError::Validation { .. })
        ));
    }
}
