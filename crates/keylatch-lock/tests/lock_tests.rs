//! Lock behaviour against the in-memory store

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keylatch_lock::{LockError, LockOptions, Locker};
use keylatch_retry::{FixedBackoff, ZeroBackoff};
use keylatch_store::{CoordStore, MemoryStore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mutual_exclusion_under_contention() {
    let locker = Locker::new(Arc::new(MemoryStore::new()));
    let inside = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for worker in 0..8 {
        let locker = locker.clone();
        let inside = inside.clone();
        let completed = completed.clone();
        handles.push(tokio::spawn(async move {
            let options = LockOptions::new()
                .value(format!("worker-{worker}"))
                .blocking_timeout(Duration::from_secs(10))
                .backoff(FixedBackoff::new(Duration::from_millis(2)));
            let lock = locker
                .acquire("shared", Duration::from_secs(5), options)
                .await
                .unwrap();

            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0, "two holders at once");
            tokio::time::sleep(Duration::from_millis(5)).await;
            inside.fetch_sub(1, Ordering::SeqCst);

            lock.release().await.unwrap();
            completed.fetch_add(1, Ordering::SeqCst);
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(completed.load(Ordering::SeqCst), 8);
}

#[tokio::test]
async fn test_foreign_release_leaves_holder_intact() {
    let store = Arc::new(MemoryStore::new());
    let locker = Locker::new(store.clone());

    let holder = locker
        .acquire("orders", Duration::from_secs(5), LockOptions::new().value("a"))
        .await
        .unwrap();

    // A forged value with the right payload but the wrong token.
    assert!(!store.compare_and_delete("orders", "not-the-token-a").await.unwrap());
    assert_eq!(
        store.get("orders").await.unwrap(),
        Some(format!("{}a", holder.token()))
    );

    holder.release().await.unwrap();
    assert_eq!(store.get("orders").await.unwrap(), None);
}

#[tokio::test]
async fn test_release_after_takeover_is_inactive() {
    let locker = Locker::new(Arc::new(MemoryStore::new()));

    let stale = locker
        .acquire("k", Duration::from_millis(30), LockOptions::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    let current = locker
        .acquire("k", Duration::from_secs(5), LockOptions::new())
        .await
        .unwrap();

    assert!(matches!(stale.release().await, Err(LockError::LockInactive)));
    current.release().await.unwrap();
}

#[tokio::test]
async fn test_abandoned_lease_expires() {
    let locker = Locker::new(Arc::new(MemoryStore::new()));

    let abandoned = locker
        .acquire("k", Duration::from_millis(50), LockOptions::new())
        .await
        .unwrap();
    std::mem::forget(abandoned);

    let started = Instant::now();
    let lock = locker
        .acquire(
            "k",
            Duration::from_secs(1),
            LockOptions::new()
                .blocking_timeout(Duration::from_secs(2))
                .backoff(FixedBackoff::new(Duration::from_millis(10))),
        )
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    lock.release().await.unwrap();
}

#[tokio::test]
async fn test_blocking_timeout_bounds_acquire() {
    let locker = Locker::new(Arc::new(MemoryStore::new()));
    let _held = locker
        .acquire("k", Duration::from_secs(30), LockOptions::new())
        .await
        .unwrap();

    let started = Instant::now();
    let err = locker
        .acquire(
            "k",
            Duration::from_secs(30),
            LockOptions::new()
                .blocking_timeout(Duration::from_millis(100))
                .backoff(FixedBackoff::new(Duration::from_millis(20))),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, LockError::AcquireLock));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(60), "gave up too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "overran deadline: {elapsed:?}");
}

#[tokio::test]
async fn test_cancellation_stops_acquire() {
    let locker = Locker::new(Arc::new(MemoryStore::new()));
    let _held = locker
        .acquire("k", Duration::from_secs(30), LockOptions::new())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = locker
        .acquire(
            "k",
            Duration::from_secs(30),
            LockOptions::new()
                .blocking_timeout(Duration::from_secs(10))
                .backoff(FixedBackoff::new(Duration::from_millis(10)))
                .cancel_on(cancel),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, LockError::AcquireLock));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_refresh_extends_lease() {
    let store = Arc::new(MemoryStore::new());
    let locker = Locker::new(store.clone());

    let mut lock = locker
        .acquire("k", Duration::from_millis(80), LockOptions::new())
        .await
        .unwrap();
    lock.refresh(Duration::from_secs(5)).await.unwrap();
    assert_eq!(lock.lease(), Duration::from_secs(5));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(store.get("k").await.unwrap().is_some());

    let err = locker
        .acquire(
            "k",
            Duration::from_secs(1),
            LockOptions::new()
                .backoff(ZeroBackoff)
                .blocking_timeout(Duration::from_millis(20)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LockError::AcquireLock));

    lock.release().await.unwrap();
}

#[tokio::test]
async fn test_unbounded_blocking_waits_for_release() {
    let locker = Locker::new(Arc::new(MemoryStore::new()));
    let held = locker
        .acquire("k", Duration::from_secs(30), LockOptions::new())
        .await
        .unwrap();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        held.release().await.unwrap();
    });

    let lock = locker
        .acquire(
            "k",
            Duration::from_secs(5),
            LockOptions::new()
                .blocking_timeout(Duration::MAX)
                .backoff(FixedBackoff::new(Duration::from_millis(10))),
        )
        .await
        .unwrap();
    lock.release().await.unwrap();
}
