//! Durable JSON-backed store.
//!
//! Every mutating operation rewrites the state file (write-temp-then-rename)
//! before returning, which is what lets a pipeline crash at any point and
//! still resume from its last completed write. Batch job tickets recorded
//! here outlive the submitting process.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{CallStore, Resolution, StoreFailure, StoreState};
use crate::types::{
    CallHash, DocHash, Document, ErrorKind, ErrorRecord, Message, MessageHash, PendingRecord,
    Response,
};

/// Error type for the journal store.
#[derive(Debug, thiserror::Error)]
pub enum JournalStoreError {
    /// Filesystem failure. Always fatal: continuing would desynchronize the
    /// cache from its durable image.
    #[error("Journal I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// State file is corrupt or from an incompatible version.
    #[error("Journal decode error: {0}")]
    Decode(#[from] serde_json::Error),
    /// Two distinct contents produced the same hash. Invariant violation.
    #[error("Hash collision detected for {0}")]
    HashCollision(String),
    /// `restore` was called for a stage that was never checkpointed.
    #[error("No snapshot recorded for stage: {0}")]
    SnapshotNotFound(String),
}

impl StoreFailure for JournalStoreError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            Self::HashCollision(_) => ErrorKind::HashCollision,
            _ => ErrorKind::Storage,
        }
    }
}

/// On-disk image: live state plus named stage snapshots.
#[derive(Debug, Default, Serialize, Deserialize)]
struct JournalImage {
    state: StoreState,
    snapshots: BTreeMap<String, StoreState>,
}

/// JSON-file-backed store rooted at a directory.
#[derive(Debug)]
pub struct JournalStore {
    path: PathBuf,
    inner: Mutex<JournalImage>,
}

const STATE_FILE: &str = "state.json";

impl JournalStore {
    /// Open (or create) a journal rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, JournalStoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let path = dir.join(STATE_FILE);

        let image = if path.exists() {
            let bytes = fs::read(&path)?;
            serde_json::from_slice(&bytes)?
        } else {
            JournalImage::default()
        };

        debug!(path = %path.display(), "opened journal store");
        Ok(Self {
            path,
            inner: Mutex::new(image),
        })
    }

    /// Clone of the live state, for snapshot comparisons in tests.
    pub fn state(&self) -> StoreState {
        self.inner.lock().state.clone()
    }

    // Atomic-enough on the platforms we care about: the state file is either
    // the old image or the new one, never a partial write.
    fn persist(&self, image: &JournalImage) -> Result<(), JournalStoreError> {
        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(image)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn mutate<T>(
        &self,
        op: impl FnOnce(&mut JournalImage) -> Result<T, JournalStoreError>,
    ) -> Result<T, JournalStoreError> {
        let mut inner = self.inner.lock();
        let result = op(&mut inner)?;
        self.persist(&inner)?;
        Ok(result)
    }
}

fn upsert_message(
    state: &mut StoreState,
    message: &Message,
) -> Result<MessageHash, JournalStoreError> {
    let hash = message.hash();
    if let Some(existing) = state.messages.get(&hash) {
        if existing != message {
            return Err(JournalStoreError::HashCollision(hash.to_string()));
        }
    } else {
        state.messages.insert(hash, message.clone());
    }
    Ok(hash)
}

#[async_trait]
impl CallStore for JournalStore {
    type Error = JournalStoreError;

    async fn put_message(&self, message: &Message) -> Result<MessageHash, Self::Error> {
        self.mutate(|image| upsert_message(&mut image.state, message))
    }

    async fn put_document(&self, document: &Document) -> Result<DocHash, Self::Error> {
        self.mutate(|image| {
            let mut hashes = Vec::with_capacity(document.len());
            for message in document.messages() {
                hashes.push(upsert_message(&mut image.state, message)?);
            }
            let doc_hash = document.hash();
            if let Some(existing) = image.state.documents.get(&doc_hash) {
                if existing != &hashes {
                    return Err(JournalStoreError::HashCollision(doc_hash.to_string()));
                }
            } else {
                image.state.documents.insert(doc_hash, hashes);
            }
            Ok(doc_hash)
        })
    }

    async fn get_document(&self, hash: &DocHash) -> Result<Option<Document>, Self::Error> {
        let inner = self.inner.lock();
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
        let inner = self.inner.lock();
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
        self.mutate(|image| {
            image.state.pending.insert(record.call_hash, record);
            Ok(())
        })
    }

    async fn put_response(&self, response: Response) -> Result<(), Self::Error> {
        self.mutate(|image| {
            image.state.pending.remove(&response.call_hash);
            image.state.errors.remove(&response.call_hash);
            image.state.responses.insert(response.call_hash, response);
            Ok(())
        })
    }

    async fn put_error(&self, error: ErrorRecord) -> Result<(), Self::Error> {
        self.mutate(|image| {
            image.state.pending.remove(&error.call_hash);
            image.state.errors.insert(error.call_hash, error);
            Ok(())
        })
    }

    async fn set_seq_id(&self, hash: &CallHash, seq_id: u64) -> Result<(), Self::Error> {
        self.mutate(|image| {
            if let Some(response) = image.state.responses.get_mut(hash) {
                response.seq_id = Some(seq_id);
            }
            Ok(())
        })
    }

    async fn list_pending(&self) -> Result<Vec<PendingRecord>, Self::Error> {
        Ok(self.inner.lock().state.pending.values().cloned().collect())
    }

    async fn put_stage_data(
        &self,
        stage: &str,
        key: &str,
        value: Value,
    ) -> Result<(), Self::Error> {
        self.mutate(|image| {
            image
                .state
                .stage_data
                .entry(stage.to_string())
                .or_default()
                .insert(key.to_string(), value);
            Ok(())
        })
    }

    async fn get_stage_data(
        &self,
        stage: &str,
        key: &str,
    ) -> Result<Option<Value>, Self::Error> {
        Ok(self
            .inner
            .lock()
            .state
            .stage_data
            .get(stage)
            .and_then(|data| data.get(key))
            .cloned())
    }

    async fn checkpoint(&self, stage_name: &str) -> Result<(), Self::Error> {
        debug!(stage = stage_name, "checkpointing journal store");
        self.mutate(|image| {
            let snapshot = image.state.clone();
            image.snapshots.insert(stage_name.to_string(), snapshot);
            Ok(())
        })
    }

    async fn restore(&self, stage_name: &str) -> Result<(), Self::Error> {
        debug!(stage = stage_name, "restoring journal store");
        self.mutate(|image| {
            let snapshot = image
                .snapshots
                .get(stage_name)
                .cloned()
                .ok_or_else(|| JournalStoreError::SnapshotNotFound(stage_name.to_string()))?;
            image.state = snapshot;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Mode;
    use tempfile::tempdir;

    fn call_hash(n: u8) -> CallHash {
        CallHash::from_digest(crate::canonical::sha256_digest(&[n]))
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let hash = call_hash(1);

        {
            let store = JournalStore::open(dir.path()).unwrap();
            store
                .put_response(Response::text_only(hash, "durable"))
                .await
                .unwrap();
        }

        // A fresh store over the same directory sees the write.
        let reopened = JournalStore::open(dir.path()).unwrap();
        let resolution = reopened.get_response(&hash).await.unwrap();
        assert_eq!(resolution.response().unwrap().text, "durable");
    }

    #[tokio::test]
    async fn test_pending_ticket_survives_reopen() {
        let dir = tempdir().unwrap();
        let hash = call_hash(2);

        {
            let store = JournalStore::open(dir.path()).unwrap();
            store
                .put_pending(PendingRecord::new(
                    hash,
                    Mode::Batch,
                    Some(crate::types::JobTicket("job_123".to_string())),
                ))
                .await
                .unwrap();
        }

        let reopened = JournalStore::open(dir.path()).unwrap();
        let pending = reopened.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(
            pending[0].ticket.as_ref().unwrap().0.as_str(),
            "job_123"
        );
    }

    #[tokio::test]
    async fn test_checkpoint_survives_reopen() {
        let dir = tempdir().unwrap();
        let hash = call_hash(3);

        {
            let store = JournalStore::open(dir.path()).unwrap();
            store
                .put_response(Response::text_only(hash, "early"))
                .await
                .unwrap();
            store.checkpoint("begin").await.unwrap();
            store
                .put_response(Response::text_only(call_hash(4), "late"))
                .await
                .unwrap();
        }

        // Simulated crash: reopen, roll back to the stage snapshot.
        let reopened = JournalStore::open(dir.path()).unwrap();
        reopened.restore("begin").await.unwrap();
        assert!(reopened.get_response(&hash).await.unwrap().is_present());
        assert_eq!(
            reopened.get_response(&call_hash(4)).await.unwrap(),
            Resolution::Absent
        );
    }

    #[tokio::test]
    async fn test_hash_collision_detected() {
        let dir = tempdir().unwrap();
        let store = JournalStore::open(dir.path()).unwrap();
        // Identical content: dedup, no error.
        store.put_message(&Message::user("same")).await.unwrap();
        store.put_message(&Message::user("same")).await.unwrap();
        assert_eq!(store.state().messages.len(), 1);
    }
}
