//! Backoff strategies
//!
//! A backoff maps the number of failed attempts so far to the wait before the
//! next one. `None` means "stop retrying".

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;

/// Pluggable wait policy between attempts.
///
/// `next` must be a pure function of `attempt`: the same input always yields
/// the same output, and calling it has no side effects.
pub trait Backoff: Send + Sync + Debug {
    /// Wait before the attempt following failed attempt number `attempt`,
    /// or `None` to give up.
    fn next(&self, attempt: u32) -> Option<Duration>;
}

/// Retry immediately, forever.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZeroBackoff;

impl Backoff for ZeroBackoff {
    fn next(&self, _attempt: u32) -> Option<Duration> {
        Some(Duration::ZERO)
    }
}

/// Never retry: a single attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoRetry;

impl Backoff for NoRetry {
    fn next(&self, _attempt: u32) -> Option<Duration> {
        None
    }
}

/// Same wait between every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff {
    pub interval: Duration,
}

impl FixedBackoff {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Backoff for FixedBackoff {
    fn next(&self, _attempt: u32) -> Option<Duration> {
        Some(self.interval)
    }
}

/// Wait grows by `step` per attempt: `(n - 1) * step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArithmeticBackoff {
    pub step: Duration,
}

impl ArithmeticBackoff {
    pub fn new(step: Duration) -> Self {
        Self { step }
    }
}

impl Backoff for ArithmeticBackoff {
    fn next(&self, attempt: u32) -> Option<Duration> {
        Some(self.step.saturating_mul(attempt.saturating_sub(1)))
    }
}

/// Wait grows by a constant factor: `first * ratio^n`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometricBackoff {
    pub first: Duration,
    pub ratio: f64,
}

impl GeometricBackoff {
    pub fn new(first: Duration, ratio: f64) -> Self {
        Self { first, ratio }
    }
}

impl Backoff for GeometricBackoff {
    fn next(&self, attempt: u32) -> Option<Duration> {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.first.as_secs_f64() * self.ratio.powi(exponent);
        // Overflow or a nonsensical ratio clamps to the longest representable wait.
        Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
    }
}

/// Caps any strategy at `max_retries` waits.
#[derive(Debug, Clone)]
pub struct Limited<B> {
    inner: B,
    max_retries: u32,
}

impl<B: Backoff> Limited<B> {
    pub fn new(inner: B, max_retries: u32) -> Self {
        Self { inner, max_retries }
    }
}

impl<B: Backoff> Backoff for Limited<B> {
    fn next(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.max_retries {
            return None;
        }
        self.inner.next(attempt)
    }
}

/// Combinators available on every backoff.
pub trait BackoffExt: Backoff + Sized {
    /// Stop after `max_retries` retries.
    fn limit(self, max_retries: u32) -> Limited<Self> {
        Limited::new(self, max_retries)
    }
}

impl<B: Backoff + Sized> BackoffExt for B {}

/// Serializable backoff description, for configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    Zero,
    None,
    Fixed { interval_ms: u64 },
    Arithmetic { step_ms: u64 },
    Geometric { first_ms: u64, ratio: f64 },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::None
    }
}

impl Backoff for BackoffStrategy {
    fn next(&self, attempt: u32) -> Option<Duration> {
        match *self {
            Self::Zero => ZeroBackoff.next(attempt),
            Self::None => NoRetry.next(attempt),
            Self::Fixed { interval_ms } => {
                FixedBackoff::new(Duration::from_millis(interval_ms)).next(attempt)
            }
            Self::Arithmetic { step_ms } => {
                ArithmeticBackoff::new(Duration::from_millis(step_ms)).next(attempt)
            }
            Self::Geometric { first_ms, ratio } => {
                GeometricBackoff::new(Duration::from_millis(first_ms), ratio).next(attempt)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometric_doubles() {
        let backoff = GeometricBackoff::new(Duration::from_millis(100), 2.0);
        assert_eq!(backoff.next(0), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next(1), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next(2), Some(Duration::from_millis(400)));
    }

    #[test]
    fn test_geometric_saturates() {
        let backoff = GeometricBackoff::new(Duration::from_secs(1), 10.0);
        assert_eq!(backoff.next(400), Some(Duration::MAX));
    }

    #[test]
    fn test_arithmetic_starts_at_zero() {
        let backoff = ArithmeticBackoff::new(Duration::from_millis(50));
        assert_eq!(backoff.next(0), Some(Duration::ZERO));
        assert_eq!(backoff.next(1), Some(Duration::ZERO));
        assert_eq!(backoff.next(2), Some(Duration::from_millis(50)));
        assert_eq!(backoff.next(3), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_fixed_and_zero() {
        let fixed = FixedBackoff::new(Duration::from_millis(30));
        assert_eq!(fixed.next(1), Some(Duration::from_millis(30)));
        assert_eq!(fixed.next(99), Some(Duration::from_millis(30)));
        assert_eq!(ZeroBackoff.next(7), Some(Duration::ZERO));
        assert_eq!(NoRetry.next(1), None);
    }

    #[test]
    fn test_limited_stops_after_max() {
        let backoff = FixedBackoff::new(Duration::from_millis(5)).limit(2);
        assert!(backoff.next(1).is_some());
        assert!(backoff.next(2).is_some());
        assert_eq!(backoff.next(3), None);
    }

    #[test]
    fn test_next_is_pure() {
        let backoff = GeometricBackoff::new(Duration::from_millis(10), 3.0);
        assert_eq!(backoff.next(4), backoff.next(4));
    }

    #[test]
    fn test_strategy_from_json() {
        let strategy: BackoffStrategy =
            serde_json::from_str(r#"{"kind":"geometric","first_ms":100,"ratio":2.0}"#).unwrap();
        assert_eq!(strategy.next(1), Some(Duration::from_millis(200)));

        let strategy: BackoffStrategy = serde_json::from_str(r#"{"kind":"none"}"#).unwrap();
        assert_eq!(strategy.next(1), None);
        assert_eq!(BackoffStrategy::default(), BackoffStrategy::None);
    }
}
