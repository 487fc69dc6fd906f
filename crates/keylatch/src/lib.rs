//! # keylatch
//!
//! Distributed coordination primitives on a shared key-value store:
//!
//! - [`lock`]: tokened mutual-exclusion leases with bounded blocking acquire
//! - [`queue`]: topic-based delay queue with redelivery and dead-lettering
//! - [`retry`]: backoff strategies and a cancellable retry driver
//! - [`store`]: the store abstraction, an in-memory backend and (feature
//!   `redis`) a Redis / KeyDB backend
//!
//! ```no_run
//! use std::time::Duration;
//! use keylatch::{Client, LockOptions};
//!
//! # async fn demo() -> Result<(), keylatch::LockError> {
//! let client = Client::in_memory("local");
//! let lock = client
//!     .acquire_lock("report:daily", Duration::from_secs(30), LockOptions::new())
//!     .await?;
//! // ... exclusive work ...
//! lock.release().await?;
//! # Ok(())
//! # }
//! ```

pub mod registry;
pub mod telemetry;

pub use keylatch_lock as lock;
pub use keylatch_queue as queue;
pub use keylatch_retry as retry;
pub use keylatch_store as store;

pub use keylatch_lock::{Lock, LockError, LockOptions, Locker};
pub use keylatch_queue::{DelayQueue, DelayQueueConfig, Job, JobId, JobReader, QueueError};
pub use keylatch_retry::{Backoff, BackoffStrategy, Retry, RetryError};
pub use keylatch_store::{ConfigError, CoordStore, MemoryStore, StoreConfig, StoreError};
pub use registry::{Client, Registry};
pub use telemetry::{init_tracing, TelemetryConfig};
