//! Persistence backends for calls, documents, and stage snapshots.

pub mod journal;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::types::{
    CallHash, DocHash, Document, ErrorKind, ErrorRecord, Message, MessageHash, PendingRecord,
    Response,
};

/// The tri-state (plus terminal failure) read the whole engine is built
/// around.
///
/// Callers must never conflate `Absent` ("never asked") with `Pending`
/// ("asked, not yet done"). A batch call that has not completed reads as
/// `Pending`, which is a normal result, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Resolution {
    /// A settled response exists for the hash.
    Present(Response),
    /// The call is dispatched but unsettled.
    Pending(PendingRecord),
    /// The call settled with a terminal error.
    Failed(ErrorRecord),
    /// The hash has never been dispatched.
    Absent,
}

impl Resolution {
    /// Whether a response is available.
    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present(_))
    }

    /// Whether the call is dispatched but unsettled.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    /// Whether the call has settled, successfully or not.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Present(_) | Self::Failed(_))
    }

    /// The response, if present.
    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::Present(response) => Some(response),
            _ => None,
        }
    }
}

/// Classify a store failure for error records and propagation policy.
///
/// Implemented by each backend's error type so the engine can distinguish a
/// hash collision (invariant violation) from an ordinary storage fault
/// without knowing the backend.
pub trait StoreFailure {
    /// The [`ErrorKind`] this failure maps to.
    fn error_kind(&self) -> ErrorKind;
}

/// The full persisted state: the four logical tables plus per-stage user
/// data.
///
/// `BTreeMap` throughout for deterministic iteration and serialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    /// message_hash → content.
    pub messages: BTreeMap<MessageHash, Message>,
    /// doc_hash → message hash sequence (content lives in `messages`).
    pub documents: BTreeMap<DocHash, Vec<MessageHash>>,
    /// call_hash → in-flight record.
    pub pending: BTreeMap<CallHash, PendingRecord>,
    /// call_hash → settled response.
    pub responses: BTreeMap<CallHash, Response>,
    /// call_hash → terminal error.
    pub errors: BTreeMap<CallHash, ErrorRecord>,
    /// stage → key → user data persisted with that stage.
    pub stage_data: BTreeMap<String, BTreeMap<String, Value>>,
}

/// Trait for call/response storage backends.
///
/// The store exclusively owns all persisted entities; the engine and stage
/// machine hold only hashes into it. All mutating operations are durably
/// written before returning; a write failure is surfaced, never dropped,
/// since silent loss would corrupt the content-addressed cache.
#[async_trait]
pub trait CallStore: Send + Sync {
    /// Error type for store operations.
    type Error: std::error::Error + StoreFailure + Send + Sync + 'static;

    /// Idempotent upsert of a message; returns its hash. Detects hash
    /// collisions against already-stored content.
    async fn put_message(&self, message: &Message) -> Result<MessageHash, Self::Error>;

    /// Idempotent upsert of a document and all its messages; returns its
    /// hash.
    async fn put_document(&self, document: &Document) -> Result<DocHash, Self::Error>;

    /// Reassemble a stored document.
    async fn get_document(&self, hash: &DocHash) -> Result<Option<Document>, Self::Error>;

    /// The tri-state read for a call hash.
    async fn get_response(&self, hash: &CallHash) -> Result<Resolution, Self::Error>;

    /// Record a dispatched-but-unsettled call.
    async fn put_pending(&self, record: PendingRecord) -> Result<(), Self::Error>;

    /// Record a settled response; clears any pending record for the hash.
    async fn put_response(&self, response: Response) -> Result<(), Self::Error>;

    /// Record a terminal error; clears any pending record for the hash.
    async fn put_error(&self, error: ErrorRecord) -> Result<(), Self::Error>;

    /// Finalize the ordering identifier on a settled response. No-op when
    /// the hash settled with an error.
    async fn set_seq_id(&self, hash: &CallHash, seq_id: u64) -> Result<(), Self::Error>;

    /// All currently pending records, ordered by call hash.
    async fn list_pending(&self) -> Result<Vec<PendingRecord>, Self::Error>;

    /// Persist user data under a stage, so non-deterministic inputs survive
    /// a resume.
    async fn put_stage_data(
        &self,
        stage: &str,
        key: &str,
        value: Value,
    ) -> Result<(), Self::Error>;

    /// Read back stage user data.
    async fn get_stage_data(&self, stage: &str, key: &str)
        -> Result<Option<Value>, Self::Error>;

    /// Snapshot the full state under a stage name.
    ///
    /// A consistent read snapshot, not a lock: concurrent writes continue
    /// and appear (or not) based on ordinary write visibility.
    async fn checkpoint(&self, stage_name: &str) -> Result<(), Self::Error>;

    /// Replace the live state with the snapshot taken under `stage_name`.
    async fn restore(&self, stage_name: &str) -> Result<(), Self::Error>;
}

pub use journal::JournalStore;
pub use memory::MemoryStore;
