//! Store backend trait and error types

use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;

/// Store error types
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Command error: {0}")]
    Command(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// One job to write into the pool and the schedule index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    /// Pool record key
    pub pool_key: String,
    /// Encoded job record
    pub record: String,
    /// Sorted-set key of the job's topic
    pub index_key: String,
    /// Execution time, unix seconds
    pub score: i64,
}

/// One job to remove from every place it can live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnscheduleEntry {
    pub pool_key: String,
    pub index_key: String,
    pub dead_key: String,
}

/// The three per-topic structures touched by a promotion sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepKeys {
    pub index_key: String,
    pub ready_key: String,
    pub dead_key: String,
}

/// Shared key-value store used for coordination.
///
/// Single-key primitives map onto plain commands. Every multi-step method is
/// applied atomically: no other client observes it half done.
#[async_trait]
pub trait CoordStore: Send + Sync + Debug {
    /// Backend name
    fn name(&self) -> &str;

    /// Check if backend is reachable
    async fn is_healthy(&self) -> bool;

    /// Write `value` with a TTL only if `key` is absent. Returns true if written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Delete `key` only if it currently holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Reset the TTL of `key` only if it currently holds `expected`.
    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Read several plain values. The result is aligned with `keys`.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;

    /// Up to `count` distinct random members of a set, in no particular order.
    async fn random_members(&self, key: &str, count: usize) -> Result<Vec<String>, StoreError>;

    /// Block up to `timeout` for an element on any of `keys`, checked in order.
    /// Returns `(list key, element)` or `None` on timeout.
    async fn pop_ready(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, StoreError>;

    /// Write every pool record and place its key in its schedule index.
    async fn schedule(&self, entries: &[ScheduleEntry]) -> Result<(), StoreError>;

    /// Remove each job from its schedule index, its dead-letter set and the pool.
    async fn unschedule(&self, entries: &[UnscheduleEntry]) -> Result<(), StoreError>;

    /// Promote every index entry with score <= `now`. Returns how many entries
    /// were moved to the ready list or the dead-letter set.
    async fn promote_due(&self, keys: &SweepKeys, now: i64) -> Result<usize, StoreError>;

    /// Read one plain value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut values = self.get_many(&[key.to_string()]).await?;
        Ok(values.pop().flatten())
    }
}
