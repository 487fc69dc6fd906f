//! # keylatch queue
//!
//! Topic-based delay queue on a shared store.
//!
//! Features:
//! - Jobs scheduled at an absolute second, batched atomic upserts
//! - At-least-once delivery: uncommitted jobs come back after `ttr`
//! - Bounded redelivery with a per-topic dead-letter set
//! - Background promotion and delivery tasks, started and stopped per topic

pub mod error;
pub mod job;
pub mod keys;
pub mod queue;

pub use error::QueueError;
pub use job::{Job, JobId, JobRecord};
pub use keys::KeySpace;
pub use queue::{DelayQueue, DelayQueueConfig, ErrorCallback, JobReader};
