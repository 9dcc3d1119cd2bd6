//! In-memory store for tests and single-process pipelines.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::{CallStore, Resolution, StoreFailure, StoreState};
use crate::types::{
    CallHash, DocHash, Document, ErrorKind, ErrorRecord, Message, MessageHash, PendingRecord,
    Response,
};

/// Error type for the in-memory store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MemoryStoreError {
    /// Two distinct contents produced the same hash. Invariant violation.
    #[error("Hash collision detected for {0}")]
    HashCollision(String),
    /// `restore` was called for a stage that was never checkpointed.
    #[error("No snapshot recorded for stage: {0}")]
    SnapshotNotFound(String),
}

impl StoreFailure for MemoryStoreError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            Self::HashCollision(_) => ErrorKind::HashCollision,
            Self::SnapshotNotFound(_) => ErrorKind::Storage,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: StoreState,
    snapshots: BTreeMap<String, StoreState>,
}

/// In-memory store.
///
/// BTreeMap-backed for deterministic iteration. Durability is the caller's
/// problem here; use [`super::JournalStore`] when state must survive the
/// process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of settled responses.
    pub fn num_responses(&self) -> usize {
        self.inner.read().state.responses.len()
    }

    /// Clone of the live state, for snapshot comparisons in tests.
    pub fn state(&self) -> StoreState {
        self.inner.read().state.clone()
    }
}

fn upsert_message(
    state: &mut StoreState,
    message: &Message,
) -> Result<MessageHash, MemoryStoreError> {
    let hash = message.hash();
    if let Some(existing) = state.messages.get(&hash) {
        if existing != message {
            return Err(MemoryStoreError::HashCollision(hash.to_string()));
        }
    } else {
        state.messages.insert(hash, message.clone());
    }
    Ok(hash)
}

#[async_trait]
impl CallStore for MemoryStore {
    type Error = MemoryStoreError;

    async fn put_message(&self, message: &Message) -> Result<MessageHash, Self::Error> {
        upsert_message(&mut self.inner.write().state, message)
    }

    async fn put_document(&self, document: &Document) -> Result<DocHash, Self::Error> {
        let mut inner = self.inner.write();
        let mut hashes = Vec::with_capacity(document.len());
        for message in document.messages() {
            hashes.push(upsert_message(&mut inner.state, message)?);
        }
        let doc_hash = document.hash();
        if let Some(existing) = inner.state.documents.get(&doc_hash) {
            if existing != &hashes {
                return Err(MemoryStoreError::HashCollision(doc_hash.to_string()));
            }
        } else {
            inner.state.documents.insert(doc_hash, hashes);
        }
        Ok(doc_hash)
    }

    async fn get_document(&self, hash: &DocHash) -> Result<Option<Document>, Self::Error> {
        let inner = self.inner.read();
        let Some(message_hashes) = inner.state.documents.get(hash) else {
            return Ok(None);
        };
        let mut messages = Vec::with_capacity(message_hashes.len());
        for mh in message_hashes {
            match inner.state.messages.get(mh) {
                Some(message) => messages.push(message.clone()),
                None => return Ok(None),
            }
        }
        Ok(Some(Document::from_messages(messages)))
    }

    async fn get_response(&self, hash: &CallHash) -> Result<Resolution, Self::Error> {
        let inner = self.inner.read();
        if let Some(response) = inner.state.responses.get(hash) {
            return Ok(Resolution::Present(response.clone()));
        }
        if let Some(record) = inner.state.pending.get(hash) {
            return Ok(Resolution::Pending(record.clone()));
        }
        if let Some(error) = inner.state.errors.get(hash) {
            return Ok(Resolution::Failed(error.clone()));
        }
        Ok(Resolution::Absent)
    }

    async fn put_pending(&self, record: PendingRecord) -> Result<(), Self::Error> {
        self.inner
            .write()
            .state
            .pending
            .insert(record.call_hash, record);
        Ok(())
    }

    async fn put_response(&self, response: Response) -> Result<(), Self::Error> {
        let mut inner = self.inner.write();
        inner.state.pending.remove(&response.call_hash);
        inner.state.errors.remove(&response.call_hash);
        inner.state.responses.insert(response.call_hash, response);
        Ok(())
    }

    async fn put_error(&self, error: ErrorRecord) -> Result<(), Self::Error> {
        let mut inner = self.inner.write();
        inner.state.pending.remove(&error.call_hash);
        inner.state.errors.insert(error.call_hash, error);
        Ok(())
    }

    async fn set_seq_id(&self, hash: &CallHash, seq_id: u64) -> Result<(), Self::Error> {
        if let Some(response) = self.inner.write().state.responses.get_mut(hash) {
            response.seq_id = Some(seq_id);
        }
        Ok(())
    }

    async fn list_pending(&self) -> Result<Vec<PendingRecord>, Self::Error> {
        Ok(self.inner.read().state.pending.values().cloned().collect())
    }

    async fn put_stage_data(
        &self,
        stage: &str,
        key: &str,
        value: Value,
    ) -> Result<(), Self::Error> {
        self.inner
            .write()
            .state
            .stage_data
            .entry(stage.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get_stage_data(
        &self,
        stage: &str,
        key: &str,
    ) -> Result<Option<Value>, Self::Error> {
        Ok(self
            .inner
            .read()
            .state
            .stage_data
            .get(stage)
            .and_then(|data| data.get(key))
            .cloned())
    }

    async fn checkpoint(&self, stage_name: &str) -> Result<(), Self::Error> {
        let mut inner = self.inner.write();
        let snapshot = inner.state.clone();
        inner.snapshots.insert(stage_name.to_string(), snapshot);
        Ok(())
    }

    async fn restore(&self, stage_name: &str) -> Result<(), Self::Error> {
        let mut inner = self.inner.write();
        let snapshot = inner
            .snapshots
            .get(stage_name)
            .cloned()
            .ok_or_else(|| MemoryStoreError::SnapshotNotFound(stage_name.to_string()))?;
        inner.state = snapshot;
        Ok(())
    }
}
