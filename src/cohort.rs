//! Cohort coordination: stable `seq_id` assignment across out-of-order
//! completions.
//!
//! A cohort is a set of calls submitted together whose relative result
//! ordering must survive reruns. Under strict ordering, a counting barrier
//! defers `seq_id` finalization until every member has settled; the final
//! assignment matches *submission* order even when completions reorder.
//! Relaxed cohorts assign at registration and accept run-to-run reordering.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::types::CallHash;

/// Identifier of a cohort within one coordinator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CohortId(u64);

impl fmt::Display for CohortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cohort-{}", self.0)
    }
}

/// Ordering guarantee requested for a cohort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ordering {
    /// `seq_id`s finalized only when the whole cohort settles, in submission
    /// order.
    Strict,
    /// `seq_id`s assigned at registration, in dispatch order.
    Relaxed,
}

/// Lifecycle of a cohort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Accepting members.
    Open,
    /// No more members; none outstanding have been checked yet.
    Closed,
    /// Some members still pending.
    Settling,
    /// Every member has a response or terminal error; `seq_id`s final.
    Settled,
}

/// Membership receipt returned by [`CohortCoordinator::register`].
#[derive(Debug, Clone, Copy)]
pub struct MemberToken {
    /// The cohort this member belongs to.
    pub cohort_id: CohortId,
    /// Submission index within the cohort.
    pub index: usize,
    /// The ordering id this member will carry once finalized.
    pub seq_slot: u64,
}

/// Error type for cohort operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CohortError {
    /// Operation on a cohort id this coordinator never issued.
    #[error("Unknown cohort: {0}")]
    Unknown(CohortId),
    /// Registration after close.
    #[error("Cohort {0} is no longer accepting members")]
    NotOpen(CohortId),
}

#[derive(Debug)]
struct Cohort {
    ordering: Ordering,
    phase: Phase,
    members: Vec<CallHash>,
    seq_slots: Vec<u64>,
    settled: Vec<bool>,
    notify: Arc<Notify>,
}

impl Cohort {
    fn pending_count(&self) -> usize {
        self.settled.iter().filter(|s| !**s).count()
    }

    fn assignments(&self) -> Vec<(CallHash, u64)> {
        self.members
            .iter()
            .copied()
            .zip(self.seq_slots.iter().copied())
            .collect()
    }
}

#[derive(Debug, Default)]
struct CoordState {
    next_cohort: u64,
    next_seq: u64,
    cohorts: BTreeMap<CohortId, Cohort>,
}

/// Allocates `seq_id` slots and runs the per-cohort settlement barrier.
///
/// Slots are drawn from one monotone counter in registration order, so a
/// deterministic pipeline reproduces the same assignment on every run.
#[derive(Debug, Default)]
pub struct CohortCoordinator {
    state: Mutex<CoordState>,
}

impl CohortCoordinator {
    /// New coordinator with the sequence counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore the sequence counter from a previous run.
    pub fn with_seq_start(next_seq: u64) -> Self {
        Self {
            state: Mutex::new(CoordState {
                next_seq,
                ..CoordState::default()
            }),
        }
    }

    /// Allocate a standalone `seq_id` for a call outside any cohort.
    /// Dispatch-order semantics, same counter.
    pub fn next_seq(&self) -> u64 {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        seq
    }

    /// Open a new cohort.
    pub fn open(&self, ordering: Ordering) -> CohortId {
        let mut state = self.state.lock();
        let id = CohortId(state.next_cohort);
        state.next_cohort += 1;
        state.cohorts.insert(
            id,
            Cohort {
                ordering,
                phase: Phase::Open,
                members: Vec::new(),
                seq_slots: Vec::new(),
                settled: Vec::new(),
                notify: Arc::new(Notify::new()),
            },
        );
        debug!(cohort = %id, ?ordering, "opened cohort");
        id
    }

    /// Register a member. Allocates its `seq_id` slot in submission order.
    ///
    /// Registering a `call_hash` the cohort already holds returns the
    /// existing member's token: the store keeps one response row per hash,
    /// so duplicates fold into one slot instead of competing for the
    /// response's `seq_id`.
    pub fn register(
        &self,
        cohort_id: CohortId,
        call_hash: CallHash,
    ) -> Result<MemberToken, CohortError> {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        let cohort = state
            .cohorts
            .get_mut(&cohort_id)
            .ok_or(CohortError::Unknown(cohort_id))?;
        if cohort.phase != Phase::Open {
            return Err(CohortError::NotOpen(cohort_id));
        }
        if let Some(index) = cohort.members.iter().position(|m| *m == call_hash) {
            return Ok(MemberToken {
                cohort_id,
                index,
                seq_slot: cohort.seq_slots[index],
            });
        }
        let index = cohort.members.len();
        cohort.members.push(call_hash);
        cohort.seq_slots.push(seq);
        cohort.settled.push(false);
        state.next_seq = seq + 1;
        Ok(MemberToken {
            cohort_id,
            index,
            seq_slot: seq,
        })
    }

    /// Stop accepting members. Transitions to `Settled` immediately when
    /// nothing is outstanding, returning the finalized assignment.
    pub fn close(
        &self,
        cohort_id: CohortId,
    ) -> Result<Option<Vec<(CallHash, u64)>>, CohortError> {
        let mut state = self.state.lock();
        let cohort = state
            .cohorts
            .get_mut(&cohort_id)
            .ok_or(CohortError::Unknown(cohort_id))?;
        if cohort.phase == Phase::Open {
            cohort.phase = Phase::Closed;
        }
        Ok(Self::try_settle(cohort, cohort_id))
    }

    /// Report that a member has settled (response or terminal error).
    ///
    /// The last settling member of a closed cohort performs the whole
    /// finalization and releases every blocked waiter; the finalized
    /// `(call_hash, seq_id)` assignment is returned to the caller so it can
    /// be persisted.
    pub fn mark_settled(
        &self,
        token: &MemberToken,
    ) -> Result<Option<Vec<(CallHash, u64)>>, CohortError> {
        let mut state = self.state.lock();
        let cohort = state
            .cohorts
            .get_mut(&token.cohort_id)
            .ok_or(CohortError::Unknown(token.cohort_id))?;
        cohort.settled[token.index] = true;
        if cohort.phase == Phase::Closed {
            cohort.phase = Phase::Settling;
        }
        Ok(Self::try_settle(cohort, token.cohort_id))
    }

    fn try_settle(cohort: &mut Cohort, id: CohortId) -> Option<Vec<(CallHash, u64)>> {
        if cohort.phase == Phase::Open || cohort.phase == Phase::Settled {
            return None;
        }
        if cohort.pending_count() > 0 {
            cohort.phase = Phase::Settling;
            return None;
        }
        cohort.phase = Phase::Settled;
        cohort.notify.notify_waiters();
        debug!(cohort = %id, members = cohort.members.len(), "cohort settled");
        Some(cohort.assignments())
    }

    /// Current phase of a cohort.
    pub fn phase(&self, cohort_id: CohortId) -> Result<Phase, CohortError> {
        let state = self.state.lock();
        state
            .cohorts
            .get(&cohort_id)
            .map(|c| c.phase)
            .ok_or(CohortError::Unknown(cohort_id))
    }

    /// Ordering mode of a cohort.
    pub fn ordering(&self, cohort_id: CohortId) -> Result<Ordering, CohortError> {
        let state = self.state.lock();
        state
            .cohorts
            .get(&cohort_id)
            .map(|c| c.ordering)
            .ok_or(CohortError::Unknown(cohort_id))
    }

    /// The member's final `seq_id`, once observable.
    ///
    /// Relaxed members read their slot immediately; strict members read
    /// `None` until the cohort settles: this is the barrier a pipeline that
    /// needs a stable ordering must respect.
    pub fn seq_id(&self, token: &MemberToken) -> Result<Option<u64>, CohortError> {
        let state = self.state.lock();
        let cohort = state
            .cohorts
            .get(&token.cohort_id)
            .ok_or(CohortError::Unknown(token.cohort_id))?;
        match cohort.ordering {
            Ordering::Relaxed => Ok(Some(token.seq_slot)),
            Ordering::Strict if cohort.phase == Phase::Settled => Ok(Some(token.seq_slot)),
            Ordering::Strict => Ok(None),
        }
    }

    /// Suspend until the cohort settles; returns the final assignment in
    /// submission order. The rendezvous point.
    pub async fn wait_settled(
        &self,
        cohort_id: CohortId,
    ) -> Result<Vec<(CallHash, u64)>, CohortError> {
        loop {
            let notify = {
                let state = self.state.lock();
                let cohort = state
                    .cohorts
                    .get(&cohort_id)
                    .ok_or(CohortError::Unknown(cohort_id))?;
                if cohort.phase == Phase::Settled {
                    return Ok(cohort.assignments());
                }
                Arc::clone(&cohort.notify)
            };
            // Re-armed each iteration; a wake between the check and the await
            // just causes one extra loop.
            notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::sha256_digest;

    fn hash(n: u8) -> CallHash {
        CallHash::from_digest(sha256_digest(&[n]))
    }

    #[test]
    fn test_strict_seq_hidden_until_settled() {
        let coord = CohortCoordinator::new();
        let cohort = coord.open(Ordering::Strict);
        let a = coord.register(cohort, hash(1)).unwrap();
        let b = coord.register(cohort, hash(2)).unwrap();
        coord.close(cohort).unwrap();

        // Out-of-order completion: b settles first.
        assert!(coord.mark_settled(&b).unwrap().is_none());
        assert_eq!(coord.seq_id(&b).unwrap(), None);
        assert_eq!(coord.phase(cohort).unwrap(), Phase::Settling);

        // Last settle finalizes in submission order.
        let assignments = coord.mark_settled(&a).unwrap().unwrap();
        assert_eq!(assignments, vec![(hash(1), 0), (hash(2), 1)]);
        assert_eq!(coord.seq_id(&a).unwrap(), Some(0));
        assert_eq!(coord.seq_id(&b).unwrap(), Some(1));
        assert_eq!(coord.phase(cohort).unwrap(), Phase::Settled);
    }

    #[test]
    fn test_relaxed_seq_immediate() {
        let coord = CohortCoordinator::new();
        let cohort = coord.open(Ordering::Relaxed);
        let a = coord.register(cohort, hash(1)).unwrap();
        assert_eq!(coord.seq_id(&a).unwrap(), Some(0));
    }

    #[test]
    fn test_duplicate_member_folds_into_one_slot() {
        let coord = CohortCoordinator::new();
        let cohort = coord.open(Ordering::Strict);
        let a = coord.register(cohort, hash(1)).unwrap();
        let dup = coord.register(cohort, hash(1)).unwrap();
        let b = coord.register(cohort, hash(2)).unwrap();
        assert_eq!(dup.index, a.index);
        assert_eq!(dup.seq_slot, a.seq_slot);
        assert_eq!(b.seq_slot, 1);
        coord.close(cohort).unwrap();

        // Settling through either token counts once; the barrier still waits
        // for the distinct member.
        assert!(coord.mark_settled(&dup).unwrap().is_none());
        assert!(coord.mark_settled(&a).unwrap().is_none());
        let assignments = coord.mark_settled(&b).unwrap().unwrap();
        assert_eq!(assignments, vec![(hash(1), 0), (hash(2), 1)]);
    }

    #[test]
    fn test_register_after_close_rejected() {
        let coord = CohortCoordinator::new();
        let cohort = coord.open(Ordering::Strict);
        coord.close(cohort).unwrap();
        assert!(matches!(
            coord.register(cohort, hash(1)),
            Err(CohortError::NotOpen(_))
        ));
    }

    #[test]
    fn test_empty_cohort_settles_on_close() {
        let coord = CohortCoordinator::new();
        let cohort = coord.open(Ordering::Strict);
        let assignments = coord.close(cohort).unwrap().unwrap();
        assert!(assignments.is_empty());
        assert_eq!(coord.phase(cohort).unwrap(), Phase::Settled);
    }

    #[test]
    fn test_seq_counter_spans_cohorts() {
        let coord = CohortCoordinator::new();
        let first = coord.open(Ordering::Relaxed);
        let a = coord.register(first, hash(1)).unwrap();
        let standalone = coord.next_seq();
        let second = coord.open(Ordering::Relaxed);
        let b = coord.register(second, hash(2)).unwrap();

        assert_eq!(a.seq_slot, 0);
        assert_eq!(standalone, 1);
        assert_eq!(b.seq_slot, 2);
    }

    #[tokio::test]
    async fn test_wait_settled_blocks_until_barrier() {
        let coord = Arc::new(CohortCoordinator::new());
        let cohort = coord.open(Ordering::Strict);
        let a = coord.register(cohort, hash(1)).unwrap();
        coord.close(cohort).unwrap();

        let waiter = {
            let coord = Arc::clone(&coord);
            tokio::spawn(async move { coord.wait_settled(cohort).await })
        };

        // Give the waiter a chance to park.
        tokio::task::yield_now().await;
        coord.mark_settled(&a).unwrap();

        let assignments = waiter.await.unwrap().unwrap();
        assert_eq!(assignments, vec![(hash(1), 0)]);
    }
}
