//! Execution counters for default-salt derivation.
//!
//! No hidden process-global state: a [`CounterState`] is created by the
//! pipeline and passed by reference into submissions. Salt derivation is a
//! pure function of `(condition_key, counter_value)`, so reruns that take the
//! same path derive the same salts and hit the cache.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Derive the default salt for the `n`-th call under a condition key.
///
/// Pure function; stable across runs.
pub fn default_salt(condition_key: &str, value: u64) -> String {
    format!("{condition_key}#{value}")
}

/// Per-condition monotone counters.
///
/// Distinct from `seq_id`: counters number *submissions* under a condition
/// key at dispatch time, while `seq_id` orders *results* (and may be deferred
/// by a strict cohort).
#[derive(Debug, Default)]
pub struct CounterState {
    counters: Mutex<BTreeMap<String, u64>>,
}

impl CounterState {
    /// Fresh state with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from previously persisted values.
    pub fn from_values(values: BTreeMap<String, u64>) -> Self {
        Self {
            counters: Mutex::new(values),
        }
    }

    /// Current value of a counter without advancing it.
    pub fn peek(&self, condition_key: &str) -> u64 {
        *self.counters.lock().get(condition_key).unwrap_or(&0)
    }

    /// Advance a counter, returning the pre-increment value.
    pub fn next_value(&self, condition_key: &str) -> u64 {
        let mut counters = self.counters.lock();
        let entry = counters.entry(condition_key.to_string()).or_insert(0);
        let value = *entry;
        *entry += 1;
        value
    }

    /// Advance a counter and derive the default salt for that position.
    pub fn next_salt(&self, condition_key: &str) -> String {
        default_salt(condition_key, self.next_value(condition_key))
    }

    /// Snapshot of all counters, for persistence.
    pub fn values(&self) -> BTreeMap<String, u64> {
        self.counters.lock().clone()
    }
}

/// Serializable snapshot form.
impl Serialize for CounterState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.values().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CounterState {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self::from_values(BTreeMap::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_per_key() {
        let state = CounterState::new();
        assert_eq!(state.next_value("a"), 0);
        assert_eq!(state.next_value("a"), 1);
        assert_eq!(state.next_value("b"), 0);
        assert_eq!(state.peek("a"), 2);
    }

    #[test]
    fn test_default_salt_is_pure() {
        assert_eq!(default_salt("sampling", 3), default_salt("sampling", 3));
        assert_ne!(default_salt("sampling", 3), default_salt("sampling", 4));
        assert_ne!(default_salt("sampling", 3), default_salt("scoring", 3));
    }

    #[test]
    fn test_next_salt_sequence_replays() {
        let first = CounterState::new();
        let salts: Vec<_> = (0..3).map(|_| first.next_salt("k")).collect();

        let rerun = CounterState::new();
        let replayed: Vec<_> = (0..3).map(|_| rerun.next_salt("k")).collect();
        assert_eq!(salts, replayed);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let state = CounterState::new();
        state.next_value("a");
        state.next_value("a");

        let restored = CounterState::from_values(state.values());
        assert_eq!(restored.next_value("a"), 2);
    }
}
