//! Chat prompt conventions for image+text prompts.

use base64::prelude::*;

use crate::error::{EngineError, Result};

/// Marks where the image goes in a user prompt.
pub const IMAGE_PLACEHOLDER: &str = "<image>";

pub const DEFAULT_SYSTEM_PROMPT: &str = "A chat between a curious human and an artificial intelligence assistant. The assistant gives helpful, detailed, and polite answers to the human's questions.\nUSER:";

/// Opening of an inline image tag; the base64 JPEG payload follows.
pub const IMG_BASE64_TAG_BEGIN: &str = "<img src=\"data:image/jpeg;base64,";

/// Closes an inline image tag.
pub const IMG_BASE64_TAG_END: &str = "\">";

/// Appended to user text when the prompt has no placeholder.
pub const ASSISTANT_SUFFIX: &str = "\nASSISTANT:";

/// Turn and role markers that end an assistant reply.
pub const CHAT_STOP_STRINGS: [&str; 4] = ["###", "<|im_end|>", "<|im_start|>", "USER:"];

pub fn chat_stop_strings() -> Vec<String> {
    CHAT_STOP_STRINGS.iter().map(|s| s.to_string()).collect()
}

/// Image bytes cut out of a prompt, and the prompt left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    pub bytes: Vec<u8>,
    pub prompt: String,
}

fn invalid_tag(reason: impl Into<String>) -> EngineError {
    EngineError::InvalidImageTag {
        reason: reason.into(),
    }
}

/// The text either side of the image block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatPrompt {
    pub system: String,
    pub user: String,
}

impl ChatPrompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        ChatPrompt {
            system: system.into(),
            user: user.into(),
        }
    }

    /// Split `prompt` at its first `<image>`. Without a placeholder the
    /// default system prompt is used and the prompt becomes the user turn.
    pub fn from_prompt(prompt: &str) -> Self {
        match prompt.split_once(IMAGE_PLACEHOLDER) {
            Some((system, user)) => ChatPrompt::new(system, user),
            None => ChatPrompt::new(DEFAULT_SYSTEM_PROMPT, format!("{}{}", prompt, ASSISTANT_SUFFIX)),
        }
    }

    pub fn contains_inline_image(prompt: &str) -> bool {
        prompt.contains(IMG_BASE64_TAG_BEGIN)
    }

    /// Decode the first `<img src="data:image/jpeg;base64,...">` tag in
    /// `prompt` and remove it from the text.
    ///
    /// `Ok(None)` when there is no tag. An unterminated tag, a payload that
    /// is not standard base64, or an empty payload is `InvalidImageTag`.
    pub fn extract_inline_image(prompt: &str) -> Result<Option<InlineImage>> {
        let begin = match prompt.find(IMG_BASE64_TAG_BEGIN) {
            Some(begin) => begin,
            None => return Ok(None),
        };
        let payload_start = begin + IMG_BASE64_TAG_BEGIN.len();
        let payload_len = prompt[payload_start..]
            .find(IMG_BASE64_TAG_END)
            .ok_or_else(|| invalid_tag(format!("tag at byte {} is not closed", begin)))?;
        let payload_end = payload_start + payload_len;

        let bytes = BASE64_STANDARD
            .decode(&prompt[payload_start..payload_end])
            .map_err(|e| invalid_tag(format!("bad base64 payload: {}", e)))?;
        if bytes.is_empty() {
            return Err(invalid_tag("empty image payload"));
        }

        let rest = &prompt[payload_end + IMG_BASE64_TAG_END.len()..];
        Ok(Some(InlineImage {
            bytes,
            prompt: format!("{}{}", &prompt[..begin], rest),
        }))
    }
}
