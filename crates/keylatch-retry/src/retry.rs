//! Retry driver
//!
//! Calls a task until it succeeds, sleeping between attempts according to a
//! [`Backoff`]. The loop ends when the task succeeds, returns an error that is
//! not retryable, the backoff says stop, the attempt ceiling is hit, the next
//! wait would cross the deadline, or the cancellation token fires.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::backoff::{Backoff, ZeroBackoff};

/// Why a retry loop gave up. Every variant keeps the last task error.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The task failed with an error the caller marked as not retryable
    #[error("aborted on attempt {attempts}: {last}")]
    Aborted { attempts: u32, last: E },

    /// The backoff or the attempt ceiling stopped the loop
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// The next wait would end past the deadline
    #[error("deadline exceeded after {attempts} attempts: {last}")]
    DeadlineExceeded { attempts: u32, last: E },

    /// The cancellation token fired while waiting
    #[error("cancelled after {attempts} attempts: {last}")]
    Cancelled { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    /// Number of task invocations made.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Aborted { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::DeadlineExceeded { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// The error returned by the last attempt.
    pub fn into_last(self) -> E {
        match self {
            Self::Aborted { last, .. }
            | Self::Exhausted { last, .. }
            | Self::DeadlineExceeded { last, .. }
            | Self::Cancelled { last, .. } => last,
        }
    }
}

/// Retry loop configuration.
///
/// With no backoff configured the loop busy-retries with zero delay.
#[derive(Debug, Clone)]
pub struct Retry {
    backoff: Arc<dyn Backoff>,
    max_attempts: Option<u32>,
    deadline: Option<Instant>,
    cancel: Option<CancellationToken>,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            backoff: Arc::new(ZeroBackoff),
            max_attempts: None,
            deadline: None,
            cancel: None,
        }
    }
}

impl Retry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backoff(mut self, backoff: impl Backoff + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Share an already boxed backoff.
    pub fn backoff_arc(mut self, backoff: Arc<dyn Backoff>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Total number of task invocations allowed (the first call included).
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline `timeout` from now. A timeout past the clock's range means
    /// no deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Instant::now().checked_add(timeout);
        self
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Run `task` until it succeeds, retrying every error.
    pub async fn run<T, E, F, Fut>(&self, task: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_if(task, |_| true).await
    }

    /// Run `task` until it succeeds, retrying only errors for which
    /// `retryable` returns true.
    pub async fn run_if<T, E, F, Fut, P>(&self, mut task: F, retryable: P) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut attempt: u32 = 1;
        loop {
            let last = match task(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !retryable(&last) {
                return Err(RetryError::Aborted { attempts: attempt, last });
            }
            if self.max_attempts.is_some_and(|max| attempt >= max) {
                return Err(RetryError::Exhausted { attempts: attempt, last });
            }
            let Some(wait) = self.backoff.next(attempt) else {
                return Err(RetryError::Exhausted { attempts: attempt, last });
            };
            if let Some(deadline) = self.deadline {
                // An unrepresentable wake-up time is past any deadline.
                let past = Instant::now()
                    .checked_add(wait)
                    .map_or(true, |wake| wake > deadline);
                if past {
                    return Err(RetryError::DeadlineExceeded { attempts: attempt, last });
                }
            }

            trace!(attempt, wait_ms = wait.as_millis() as u64, "retrying after backoff");

            match &self.cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            return Err(RetryError::Cancelled { attempts: attempt, last });
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                None => tokio::time::sleep(wait).await,
            }

            attempt = attempt.saturating_add(1);
        }
    }
}
