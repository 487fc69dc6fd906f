//! Distributed mutual-exclusion lock
//!
//! A lock is a single store key holding `token ++ value` with a TTL. The
//! token is generated per acquisition, so only the acquirer can release or
//! refresh the lease: both operations compare the stored value inside one
//! atomic store operation. An abandoned lease disappears when its TTL runs out.

use std::sync::Arc;
use std::time::Duration;

use keylatch_retry::{Backoff, NoRetry, Retry, RetryError};
use keylatch_store::{CoordStore, StoreError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lock error types
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The lock is held by someone else, or the lease was lost
    #[error("failed to acquire the lock")]
    AcquireLock,

    /// Release of a lease this holder no longer owns
    #[error("lock inactive")]
    LockInactive,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Acquisition options
#[derive(Debug, Clone)]
pub struct LockOptions {
    value: String,
    blocking_timeout: Option<Duration>,
    backoff: Arc<dyn Backoff>,
    cancel: Option<CancellationToken>,
}

impl Default for LockOptions {
    /// A single, non-blocking attempt with no payload.
    fn default() -> Self {
        Self {
            value: String::new(),
            blocking_timeout: None,
            backoff: Arc::new(NoRetry),
            cancel: None,
        }
    }
}

impl LockOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload stored after the token.
    pub fn value(mut self, value: impl Into<String>) -> Self {
        self.value = value.into();
        self
    }

    /// How long `acquire` may keep retrying. Defaults to the lease duration.
    /// `Duration::MAX` blocks until the lock is free or the backoff stops.
    pub fn blocking_timeout(mut self, timeout: Duration) -> Self {
        self.blocking_timeout = Some(timeout);
        self
    }

    pub fn backoff(mut self, backoff: impl Backoff + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Give up as soon as `token` is cancelled.
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Hands out locks backed by one store.
#[derive(Debug, Clone)]
pub struct Locker {
    store: Arc<dyn CoordStore>,
}

impl Locker {
    pub fn new(store: Arc<dyn CoordStore>) -> Self {
        Self { store }
    }

    /// Acquire `key` for `lease`.
    ///
    /// Retries on contention according to the options' backoff until the
    /// blocking timeout (or `lease` if unset) would be crossed, the backoff
    /// stops, or the cancellation token fires; all of these yield
    /// [`LockError::AcquireLock`]. Store failures are returned immediately.
    pub async fn acquire(
        &self,
        key: impl Into<String>,
        lease: Duration,
        options: LockOptions,
    ) -> Result<Lock, LockError> {
        let key = key.into();
        let token = Uuid::new_v4().to_string();
        let stored = format!("{token}{}", options.value);
        let mut retry = Retry::new()
            .backoff_arc(options.backoff.clone())
            .timeout(options.blocking_timeout.unwrap_or(lease));
        if let Some(cancel) = &options.cancel {
            retry = retry.cancel_on(cancel.clone());
        }

        let store = self.store.as_ref();
        let (key_ref, stored_ref) = (key.as_str(), stored.as_str());
        let outcome = retry
            .run_if(
                move |_| async move {
                    match store.set_if_absent(key_ref, stored_ref, lease).await {
                        Ok(true) => Ok(()),
                        Ok(false) => Err(LockError::AcquireLock),
                        Err(e) => Err(LockError::Store(e)),
                    }
                },
                |e| matches!(e, LockError::AcquireLock),
            )
            .await;

        match outcome {
            Ok(()) => {
                debug!(%key, "lock acquired");
                Ok(Lock {
                    store: self.store.clone(),
                    key,
                    value: options.value,
                    token,
                    lease,
                })
            }
            Err(RetryError::Aborted { last, .. }) => Err(last),
            Err(e) => {
                debug!(%key, attempts = e.attempts(), reason = %e, "lock not acquired");
                Err(LockError::AcquireLock)
            }
        }
    }
}

/// A held lease
#[derive(Debug)]
pub struct Lock {
    store: Arc<dyn CoordStore>,
    key: String,
    value: String,
    token: String,
    lease: Duration,
}

impl Lock {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Lease duration set by the last acquire or refresh.
    pub fn lease(&self) -> Duration {
        self.lease
    }

    fn stored_value(&self) -> String {
        format!("{}{}", self.token, self.value)
    }

    /// Delete the key if this lease still owns it.
    ///
    /// Returns [`LockError::LockInactive`] when the lease already expired or
    /// another holder owns the key.
    pub async fn release(&self) -> Result<(), LockError> {
        if self.store.compare_and_delete(&self.key, &self.stored_value()).await? {
            debug!(key = %self.key, "lock released");
            Ok(())
        } else {
            warn!(key = %self.key, "lock release: key missing or owned by another holder");
            Err(LockError::LockInactive)
        }
    }

    /// Extend the lease to `lease` from now if this holder still owns it.
    ///
    /// Returns [`LockError::AcquireLock`] when ownership was lost.
    pub async fn refresh(&mut self, lease: Duration) -> Result<(), LockError> {
        if self
            .store
            .compare_and_expire(&self.key, &self.stored_value(), lease)
            .await?
        {
            self.lease = lease;
            debug!(key = %self.key, lease_ms = lease.as_millis() as u64, "lock refreshed");
            Ok(())
        } else {
            Err(LockError::AcquireLock)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keylatch_retry::FixedBackoff;
    use keylatch_store::MemoryStore;
    use tokio::time::Instant;

    fn locker() -> Locker {
        Locker::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_stored_value_is_token_then_value() {
        let store = Arc::new(MemoryStore::new());
        let locker = Locker::new(store.clone());
        let lock = locker
            .acquire("job:42", Duration::from_secs(5), LockOptions::new().value("worker-a"))
            .await
            .unwrap();

        let stored = store.get("job:42").await.unwrap().unwrap();
        assert_eq!(stored, format!("{}worker-a", lock.token()));
        assert_eq!(lock.key(), "job:42");
        assert_eq!(lock.value(), "worker-a");
    }

    #[tokio::test]
    async fn test_tokens_are_unique_per_acquisition() {
        let locker = locker();
        let first = locker
            .acquire("a", Duration::from_secs(5), LockOptions::new())
            .await
            .unwrap();
        let second = locker
            .acquire("b", Duration::from_secs(5), LockOptions::new())
            .await
            .unwrap();
        assert_ne!(first.token(), second.token());
    }

    #[tokio::test]
    async fn test_default_options_do_not_block() {
        let locker = locker();
        let _held = locker
            .acquire("k", Duration::from_secs(10), LockOptions::new())
            .await
            .unwrap();

        let started = Instant::now();
        let err = locker
            .acquire("k", Duration::from_secs(10), LockOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::AcquireLock));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_unbounded_durations_do_not_overflow() {
        let locker = locker();
        let lock = locker
            .acquire(
                "k",
                Duration::from_secs(5),
                LockOptions::new().blocking_timeout(Duration::MAX),
            )
            .await
            .unwrap();

        let err = locker
            .acquire(
                "k",
                Duration::from_secs(5),
                LockOptions::new().backoff(FixedBackoff::new(Duration::MAX)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::AcquireLock));
        lock.release().await.unwrap();

        let long = locker
            .acquire("long", Duration::from_secs(u64::MAX / 2), LockOptions::new())
            .await
            .unwrap();
        long.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_twice_is_inactive() {
        let locker = locker();
        let lock = locker
            .acquire("k", Duration::from_secs(5), LockOptions::new())
            .await
            .unwrap();
        lock.release().await.unwrap();
        assert!(matches!(lock.release().await, Err(LockError::LockInactive)));
    }

    #[tokio::test]
    async fn test_refresh_after_expiry_fails() {
        let locker = locker();
        let mut lock = locker
            .acquire("k", Duration::from_millis(20), LockOptions::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            lock.refresh(Duration::from_secs(1)).await,
            Err(LockError::AcquireLock)
        ));
        assert_eq!(lock.lease(), Duration::from_millis(20));
    }
}
