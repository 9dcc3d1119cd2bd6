//! Message types: the atomic units of conversational content.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::canonical::{normalize_text, sha256_digest, Digest};

/// Role of a text message's author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// User message.
    User,
    /// Assistant/model response.
    Assistant,
    /// System instructions.
    System,
    /// Developer instructions (OpenAI-style).
    Developer,
}

impl Role {
    /// Parse role from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            "developer" => Some(Self::Developer),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Developer => "developer",
        }
    }
}

impl Default for Role {
    fn default() -> Self {
        Self::User
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Content-addressed identity of a [`Message`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MessageHash(Digest);

impl MessageHash {
    /// Wrap a raw digest.
    pub fn new(digest: Digest) -> Self {
        Self(digest)
    }

    /// The underlying digest.
    pub fn as_digest(&self) -> &Digest {
        &self.0
    }
}

impl fmt::Display for MessageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An atomic unit of conversational content.
///
/// Immutable once stored; the store deduplicates identical messages across
/// documents by [`MessageHash`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    /// Plain text content with an author role.
    Text {
        /// Author role.
        role: Role,
        /// Text body. Normalized (newlines, trim) before hashing.
        text: String,
    },
    /// Raw image content.
    Image {
        /// MIME type, e.g. `image/png`.
        media_type: String,
        /// Encoded image bytes. The bytes themselves are the canonical form.
        bytes: Vec<u8>,
    },
    /// Result of a tool/function invocation fed back into the conversation.
    ToolResult {
        /// Provider-side id of the tool call this answers.
        call_id: String,
        /// Tool name.
        name: String,
        /// Tool output content.
        content: String,
    },
}

// Domain-separation tags for hashing. Stable; part of CANONICAL_VERSION.
const TAG_TEXT: u8 = 0x01;
const TAG_IMAGE: u8 = 0x02;
const TAG_TOOL_RESULT: u8 = 0x03;

fn push_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn push_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    buf.extend_from_slice(&(b.len() as u64).to_le_bytes());
    buf.extend_from_slice(b);
}

impl Message {
    /// Text message shorthand.
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self::Text {
            role,
            text: text.into(),
        }
    }

    /// User text message shorthand.
    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    /// System instructions shorthand.
    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    /// Canonical bytes of this message.
    ///
    /// Each variant is tagged and every field length-prefixed, so no two
    /// distinct messages share a preimage. Text fields are normalized; image
    /// bytes are hashed as-is. Nothing outside provider-bound content (no
    /// timestamps, no ids) participates.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::Text { role, text } => {
                buf.push(TAG_TEXT);
                push_str(&mut buf, role.as_str());
                push_str(&mut buf, &normalize_text(text));
            }
            Self::Image { media_type, bytes } => {
                buf.push(TAG_IMAGE);
                push_str(&mut buf, media_type);
                push_bytes(&mut buf, bytes);
            }
            Self::ToolResult {
                call_id,
                name,
                content,
            } => {
                buf.push(TAG_TOOL_RESULT);
                push_str(&mut buf, call_id);
                push_str(&mut buf, name);
                push_str(&mut buf, &normalize_text(content));
            }
        }
        buf
    }

    /// Content-addressed identity of this message.
    pub fn hash(&self) -> MessageHash {
        MessageHash(sha256_digest(&self.canonical_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_hash_ignores_newline_style() {
        let a = Message::user("Hello\r\nWorld");
        let b = Message::user("Hello\nWorld");
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_role_affects_hash() {
        let a = Message::text(Role::User, "same");
        let b = Message::text(Role::Assistant, "same");
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_variants_never_collide() {
        // A text message whose body spells out image fields must not collide
        // with the image variant.
        let text = Message::user("image/png");
        let image = Message::Image {
            media_type: "image/png".to_string(),
            bytes: vec![],
        };
        assert_ne!(text.hash(), image.hash());
    }

    #[test]
    fn test_image_bytes_affect_hash() {
        let a = Message::Image {
            media_type: "image/png".to_string(),
            bytes: vec![1, 2, 3],
        };
        let b = Message::Image {
            media_type: "image/png".to_string(),
            bytes: vec![1, 2, 4],
        };
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_tool_result_hash_stable() {
        let a = Message::ToolResult {
            call_id: "call_1".to_string(),
            name: "search".to_string(),
            content: "result\r\n".to_string(),
        };
        let b = Message::ToolResult {
            call_id: "call_1".to_string(),
            name: "search".to_string(),
            content: "result".to_string(),
        };
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!(Role::parse("user"), Some(Role::User));
        assert_eq!(Role::parse("ASSISTANT"), Some(Role::Assistant));
        assert_eq!(Role::parse("invalid"), None);
    }
}
