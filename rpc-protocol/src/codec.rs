//! Newline-delimited JSON framing.
//!
//! One message per line. Serialized JSON never contains a raw newline, so a
//! line boundary is always a frame boundary.

use crate::message::Message;
use crate::message::raw_tag;

/// Upper bound on a single encoded frame unless configured otherwise.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame exceeds the {limit} byte limit")]
    FrameTooLarge { limit: usize },

    #[error("frame does not hold a single tagged message")]
    Untagged,

    #[error("malformed {tag} message")]
    MalformedVariant { tag: String },
}

/// Serialize a message as one newline-terminated frame.
pub fn encode_frame(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parse one frame. Trailing whitespace (including the newline) is ignored.
///
/// A well-formed message with a tag this implementation does not know
/// decodes to [`Message::Unknown`]; a known tag with a body that does not
/// match its schema is an error.
pub fn decode_frame(line: &str, max_frame_bytes: usize) -> Result<Message, ProtocolError> {
    if line.len() > max_frame_bytes {
        return Err(ProtocolError::FrameTooLarge {
            limit: max_frame_bytes,
        });
    }
    let message: Message = serde_json::from_str(line.trim_end())?;
    if let Message::Unknown(raw) = &message {
        let Some(tag) = raw_tag(raw) else {
            return Err(ProtocolError::Untagged);
        };
        if Message::KNOWN_TAGS.contains(&tag) {
            return Err(ProtocolError::MalformedVariant {
                tag: tag.to_string(),
            });
        }
    }
    Ok(message)
}
