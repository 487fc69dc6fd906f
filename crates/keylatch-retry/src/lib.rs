//! # keylatch retry
//!
//! Backoff strategies and the generic retry loop used by blocking lock
//! acquisition.
//!
//! - [`Backoff`] trait with zero, fixed, arithmetic and geometric strategies
//! - [`Limited`] to bound any strategy to a retry count
//! - [`Retry`] driver with attempt ceiling, deadline and cancellation

pub mod backoff;
pub mod retry;

pub use backoff::{
    ArithmeticBackoff, Backoff, BackoffExt, BackoffStrategy, FixedBackoff, GeometricBackoff,
    Limited, NoRetry, ZeroBackoff,
};
pub use retry::{Retry, RetryError};
