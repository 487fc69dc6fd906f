//! # keylatch lock
//!
//! Single-key distributed mutual exclusion on a shared store.
//!
//! - [`Locker::acquire`] with bounded blocking, backoff and cancellation
//! - [`Lock::release`] / [`Lock::refresh`], gated on the acquisition token

pub mod lock;

pub use lock::{Lock, LockError, LockOptions, Locker};
