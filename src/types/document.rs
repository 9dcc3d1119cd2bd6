//! Document types: the ordered message sequence forming one call's input.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::canonical::{sha256_digest, Digest};
use crate::types::message::{Message, MessageHash, Role};

/// Content-addressed identity of a [`Document`].
///
/// A pure function of the message sequence: two documents with identical
/// message content always share a `DocHash`, independent of when or how they
/// were built.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DocHash(Digest);

impl DocHash {
    /// Wrap a raw digest.
    pub fn new(digest: Digest) -> Self {
        Self(digest)
    }

    /// The underlying digest.
    pub fn as_digest(&self) -> &Digest {
        &self.0
    }
}

impl fmt::Display for DocHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An ordered sequence of messages: the full input to one call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    messages: Vec<Message>,
}

impl Document {
    /// Empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Document from a message sequence.
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    /// Single-user-prompt document, optionally preceded by system
    /// instructions.
    pub fn from_prompt(instructions: Option<&str>, prompt: &str) -> Self {
        let mut messages = Vec::new();
        if let Some(instructions) = instructions {
            messages.push(Message::system(instructions));
        }
        messages.push(Message::user(prompt));
        Self { messages }
    }

    /// Append a message.
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// The message sequence.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the document is empty.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Hashes of the message sequence, in order.
    pub fn message_hashes(&self) -> Vec<MessageHash> {
        self.messages.iter().map(Message::hash).collect()
    }

    /// Content-addressed identity: hash over the ordered message hashes.
    pub fn hash(&self) -> DocHash {
        let mut buf = Vec::with_capacity(8 + self.messages.len() * 32);
        buf.extend_from_slice(&(self.messages.len() as u64).to_le_bytes());
        for message in &self.messages {
            buf.extend_from_slice(message.hash().as_digest().as_bytes());
        }
        DocHash(sha256_digest(&buf))
    }
}

impl From<&str> for Document {
    fn from(prompt: &str) -> Self {
        Self::from_prompt(None, prompt)
    }
}

/// Error converting raw input into a [`Document`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum DocumentConversionError {
    /// A raw mapping key was not a recognized role.
    #[error("Unknown role in raw document mapping: {0}")]
    UnknownRole(String),
}

/// Input accepted at the submission boundary.
///
/// Pipelines may pass a fully structured [`Document`] or a raw ordered
/// role/text mapping; both are normalized to `Document` by
/// [`DocumentInput::into_document`] before any hashing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocumentInput {
    /// Already-structured document.
    Structured(Document),
    /// Ordered (role, text) pairs, e.g. `[("system", ...), ("user", ...)]`.
    RawMapping(Vec<(String, String)>),
}

impl DocumentInput {
    /// Normalize to a [`Document`]. The single conversion boundary: everything
    /// downstream (hashing, dispatch) sees only `Document`.
    pub fn into_document(self) -> Result<Document, DocumentConversionError> {
        match self {
            Self::Structured(doc) => Ok(doc),
            Self::RawMapping(pairs) => {
                let mut doc = Document::new();
                for (key, text) in pairs {
                    let role = Role::parse(&key)
                        .ok_or_else(|| DocumentConversionError::UnknownRole(key.clone()))?;
                    doc.push(Message::text(role, text));
                }
                Ok(doc)
            }
        }
    }
}

impl From<Document> for DocumentInput {
    fn from(doc: Document) -> Self {
        Self::Structured(doc)
    }
}

impl From<&str> for DocumentInput {
    fn from(prompt: &str) -> Self {
        Self::Structured(Document::from(prompt))
    }
}
