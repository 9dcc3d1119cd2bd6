//! The stage/checkpoint machine.
//!
//! Pipeline progress is a linear sequence of named stages. Every `exit`
//! checkpoints the store synchronously before returning, so a crash after a
//! stage's business logic but before the next stage still leaves a resumable
//! snapshot. `begin` is entered automatically; `finish` closes the run under
//! the reserved `end` stage.
//!
//! Resuming after a crash is the store's job: `store.restore(stage)` rolls
//! the state back to that stage's snapshot, then a fresh machine starts a new
//! run; cached responses make the replayed stages free. Stage names are
//! never revisited within one run.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::CallStore;

/// Reserved initial stage name.
pub const STAGE_BEGIN: &str = "begin";
/// Reserved terminal stage name.
pub const STAGE_END: &str = "end";

/// Stage-data key under which the machine persists the stage record itself.
const STAGE_RECORD_KEY: &str = "@stage";

/// One completed or in-progress stage of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    /// The run this stage belongs to.
    pub run_id: Uuid,
    /// Pipeline-defined stage name.
    pub name: String,
    /// When the stage was entered.
    pub entered_at: DateTime<Utc>,
    /// When the stage was exited; `None` while in progress.
    pub exited_at: Option<DateTime<Utc>>,
}

impl Stage {
    fn enter(run_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            run_id,
            name: name.into(),
            entered_at: Utc::now(),
            exited_at: None,
        }
    }
}

/// Error type for stage transitions.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StageError {
    /// `begin` and `end` are machine-managed and cannot be entered manually.
    #[error("Stage name is reserved: {0}")]
    Reserved(String),
    /// Stages form a strict sequence per run; a name cannot recur.
    #[error("Stage already visited in this run: {0}")]
    Revisited(String),
    /// `exit` named a stage other than the current one.
    #[error("Cannot exit stage {requested:?} while in stage {current:?}")]
    WrongStage {
        /// The stage the caller tried to exit.
        requested: String,
        /// The stage actually in progress.
        current: String,
    },
    /// `enter` while another stage is still in progress.
    #[error("Stage {0} is still in progress; exit it first")]
    StillInProgress(String),
    /// Operation that needs an active stage, issued between stages or after
    /// `finish`.
    #[error("No stage is in progress")]
    NoActiveStage,
    /// The machine already ran to `end`.
    #[error("Stage machine already finished")]
    Finished,
    /// Checkpoint or stage-data write failed. Always fatal.
    #[error("Storage failure: {0}")]
    Storage(String),
}

#[derive(Debug)]
struct MachineState {
    current: Option<Stage>,
    visited: BTreeSet<String>,
    history: Vec<Stage>,
    finished: bool,
}

/// Linear stage machine over a store. See the module docs.
#[derive(Debug)]
pub struct StageMachine<S> {
    store: Arc<S>,
    run_id: Uuid,
    state: Mutex<MachineState>,
}

impl<S: CallStore> StageMachine<S> {
    /// Start a run. The reserved `begin` stage is entered automatically.
    pub fn start(store: Arc<S>) -> Self {
        let run_id = Uuid::new_v4();
        let mut visited = BTreeSet::new();
        visited.insert(STAGE_BEGIN.to_string());
        info!(%run_id, stage = STAGE_BEGIN, "pipeline run started");
        Self {
            store,
            run_id,
            state: Mutex::new(MachineState {
                current: Some(Stage::enter(run_id, STAGE_BEGIN)),
                visited,
                history: Vec::new(),
                finished: false,
            }),
        }
    }

    /// Identity of this run. Reruns over the same store get fresh ids.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Name of the stage currently in progress.
    pub fn current(&self) -> Option<String> {
        self.state.lock().current.as_ref().map(|s| s.name.clone())
    }

    /// Completed stages of this run, in order.
    pub fn history(&self) -> Vec<Stage> {
        self.state.lock().history.clone()
    }

    /// Enter a stage. The previous stage must already be exited.
    pub fn enter(&self, name: &str) -> Result<(), StageError> {
        if name == STAGE_BEGIN || name == STAGE_END {
            return Err(StageError::Reserved(name.to_string()));
        }
        let mut state = self.state.lock();
        if state.finished {
            return Err(StageError::Finished);
        }
        if let Some(current) = &state.current {
            return Err(StageError::StillInProgress(current.name.clone()));
        }
        if !state.visited.insert(name.to_string()) {
            return Err(StageError::Revisited(name.to_string()));
        }
        info!(stage = name, "entered stage");
        state.current = Some(Stage::enter(self.run_id, name));
        Ok(())
    }

    /// Exit the named stage, checkpointing the store before returning.
    pub async fn exit(&self, name: &str) -> Result<(), StageError> {
        let stage = {
            let mut state = self.state.lock();
            match state.current.take() {
                Some(mut stage) if stage.name == name => {
                    stage.exited_at = Some(Utc::now());
                    stage
                }
                Some(stage) => {
                    let current = stage.name.clone();
                    state.current = Some(stage);
                    return Err(StageError::WrongStage {
                        requested: name.to_string(),
                        current,
                    });
                }
                None => return Err(StageError::NoActiveStage),
            }
        };

        self.checkpoint_stage(&stage).await?;
        info!(stage = name, "exited stage");
        self.state.lock().history.push(stage);
        Ok(())
    }

    /// Close the run: exit the in-progress stage if any, then checkpoint
    /// under the reserved `end` stage.
    pub async fn finish(&self) -> Result<(), StageError> {
        let open = {
            let state = self.state.lock();
            if state.finished {
                return Err(StageError::Finished);
            }
            state.current.as_ref().map(|s| s.name.clone())
        };
        if let Some(name) = open {
            self.exit(&name).await?;
        }

        let mut end = Stage::enter(self.run_id, STAGE_END);
        end.exited_at = Some(end.entered_at);
        self.checkpoint_stage(&end).await?;
        info!("pipeline run finished");

        let mut state = self.state.lock();
        state.history.push(end);
        state.finished = true;
        Ok(())
    }

    /// Persist a value under the current stage, so non-deterministic inputs
    /// (sampled ids, shuffled orders) survive a crash and resume.
    pub async fn save_data<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StageError> {
        let stage = self.active_stage()?;
        let value =
            serde_json::to_value(value).map_err(|e| StageError::Storage(e.to_string()))?;
        self.store
            .put_stage_data(&stage, key, value)
            .await
            .map_err(|e| StageError::Storage(e.to_string()))
    }

    /// Read back a value saved under a stage in this or a previous run.
    pub async fn load_data<T: DeserializeOwned>(
        &self,
        stage: &str,
        key: &str,
    ) -> Result<Option<T>, StageError> {
        let value = self
            .store
            .get_stage_data(stage, key)
            .await
            .map_err(|e| StageError::Storage(e.to_string()))?;
        match value {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| StageError::Storage(e.to_string())),
            None => Ok(None),
        }
    }

    fn active_stage(&self) -> Result<String, StageError> {
        self.state
            .lock()
            .current
            .as_ref()
            .map(|s| s.name.clone())
            .ok_or(StageError::NoActiveStage)
    }

    async fn checkpoint_stage(&self, stage: &Stage) -> Result<(), StageError> {
        let record =
            serde_json::to_value(stage).map_err(|e| StageError::Storage(e.to_string()))?;
        self.store
            .put_stage_data(&stage.name, STAGE_RECORD_KEY, record)
            .await
            .map_err(|e| StageError::Storage(e.to_string()))?;
        self.store
            .checkpoint(&stage.name)
            .await
            .map_err(|e| StageError::Storage(e.to_string()))
    }
}

impl<S> Drop for StageMachine<S> {
    fn drop(&mut self) {
        let state = self.state.lock();
        if !state.finished {
            // Dropped mid-run. The last exited stage is checkpointed; work
            // since then is only resumable through the response cache.
            warn!(
                stage = state.current.as_ref().map(|s| s.name.as_str()),
                "stage machine dropped without finish()"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::sha256_digest;
    use crate::store::{MemoryStore, Resolution};
    use crate::types::{CallHash, Response};

    fn call_hash(n: u8) -> CallHash {
        CallHash::from_digest(sha256_digest(&[n]))
    }

    #[tokio::test]
    async fn test_begin_is_entered_automatically() {
        let machine = StageMachine::start(Arc::new(MemoryStore::new()));
        assert_eq!(machine.current().as_deref(), Some(STAGE_BEGIN));
    }

    #[tokio::test]
    async fn test_linear_sequence_and_timestamps() {
        let machine = StageMachine::start(Arc::new(MemoryStore::new()));
        machine.exit(STAGE_BEGIN).await.unwrap();
        machine.enter("middle").unwrap();
        machine.exit("middle").await.unwrap();
        machine.finish().await.unwrap();

        let history = machine.history();
        let names: Vec<&str> = history.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec![STAGE_BEGIN, "middle", STAGE_END]);
        assert!(history.iter().all(|s| s.exited_at.is_some()));
    }

    #[tokio::test]
    async fn test_reserved_names_rejected() {
        let machine = StageMachine::start(Arc::new(MemoryStore::new()));
        machine.exit(STAGE_BEGIN).await.unwrap();
        assert!(matches!(
            machine.enter(STAGE_BEGIN),
            Err(StageError::Reserved(_))
        ));
        assert!(matches!(
            machine.enter(STAGE_END),
            Err(StageError::Reserved(_))
        ));
    }

    #[tokio::test]
    async fn test_no_revisit_within_run() {
        let machine = StageMachine::start(Arc::new(MemoryStore::new()));
        machine.exit(STAGE_BEGIN).await.unwrap();
        machine.enter("middle").unwrap();
        machine.exit("middle").await.unwrap();
        assert!(matches!(
            machine.enter("middle"),
            Err(StageError::Revisited(_))
        ));
    }

    #[tokio::test]
    async fn test_exit_wrong_stage() {
        let machine = StageMachine::start(Arc::new(MemoryStore::new()));
        let err = machine.exit("middle").await.unwrap_err();
        assert!(matches!(err, StageError::WrongStage { .. }));
        // Still in begin; the failed exit changed nothing.
        assert_eq!(machine.current().as_deref(), Some(STAGE_BEGIN));
    }

    #[tokio::test]
    async fn test_exit_checkpoints_store() {
        let store = Arc::new(MemoryStore::new());
        let machine = StageMachine::start(Arc::clone(&store));

        store
            .put_response(Response::text_only(call_hash(1), "from begin"))
            .await
            .unwrap();
        machine.exit(STAGE_BEGIN).await.unwrap();

        machine.enter("middle").unwrap();
        store
            .put_response(Response::text_only(call_hash(2), "from middle"))
            .await
            .unwrap();

        // Roll back to the begin snapshot: middle's write is gone.
        store.restore(STAGE_BEGIN).await.unwrap();
        assert!(store.get_response(&call_hash(1)).await.unwrap().is_present());
        assert_eq!(
            store.get_response(&call_hash(2)).await.unwrap(),
            Resolution::Absent
        );
    }

    #[tokio::test]
    async fn test_finish_closes_open_stage_and_checkpoints_end() {
        let store = Arc::new(MemoryStore::new());
        let machine = StageMachine::start(Arc::clone(&store));
        machine.exit(STAGE_BEGIN).await.unwrap();
        machine.enter("middle").unwrap();
        machine.finish().await.unwrap();

        assert_eq!(machine.current(), None);
        // The end snapshot exists: restoring it is not an error.
        store.restore(STAGE_END).await.unwrap();
        assert!(matches!(machine.finish().await, Err(StageError::Finished)));
    }

    #[tokio::test]
    async fn test_stage_data_survives_for_resume() {
        let store = Arc::new(MemoryStore::new());
        let machine = StageMachine::start(Arc::clone(&store));
        machine
            .save_data("sampled_ids", &vec![4u64, 8, 15])
            .await
            .unwrap();
        machine.exit(STAGE_BEGIN).await.unwrap();

        // A later run reads the stage's data back.
        let later = StageMachine::start(store);
        let ids: Option<Vec<u64>> = later.load_data(STAGE_BEGIN, "sampled_ids").await.unwrap();
        assert_eq!(ids, Some(vec![4, 8, 15]));
    }
}
