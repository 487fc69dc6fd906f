//! # keylatch store
//!
//! Key-value store backends for distributed locks and delay queues.
//!
//! Supports:
//! - In-memory (for testing and single-process use)
//! - Redis / KeyDB (feature `redis`), with Lua scripts for atomic multi-step updates

pub mod backend;
pub mod config;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod scripts;

pub use backend::{CoordStore, ScheduleEntry, StoreError, SweepKeys, UnscheduleEntry};
pub use config::{ConfigError, StoreConfig};
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis::RedisStore;
