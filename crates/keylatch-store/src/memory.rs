//! In-memory store with the same atomicity guarantees as the Redis scripts
//!
//! The whole keyspace sits behind one mutex, so every trait method is a
//! single critical section. TTLs expire lazily on access.

use async_trait::async_trait;
use rand::seq::IteratorRandom;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::backend::{CoordStore, ScheduleEntry, StoreError, SweepKeys, UnscheduleEntry};

#[derive(Debug)]
struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl StringEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
struct Keyspace {
    strings: HashMap<String, StringEntry>,
    sorted: HashMap<String, HashMap<String, i64>>,
    sets: HashMap<String, HashSet<String>>,
    lists: HashMap<String, VecDeque<String>>,
}

impl Keyspace {
    fn live_value(&mut self, key: &str) -> Option<&str> {
        let now = Instant::now();
        if self.strings.get(key).is_some_and(|e| !e.is_live(now)) {
            self.strings.remove(key);
        }
        self.strings.get(key).map(|e| e.value.as_str())
    }

    fn zadd(&mut self, key: &str, member: &str, score: i64) {
        self.sorted
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
    }

    fn zrem(&mut self, key: &str, member: &str) {
        if let Some(zset) = self.sorted.get_mut(key) {
            zset.remove(member);
            if zset.is_empty() {
                self.sorted.remove(key);
            }
        }
    }

    /// Members with score <= `max`, ordered by (score, member).
    fn zrange_to(&self, key: &str, max: i64) -> Vec<String> {
        let Some(zset) = self.sorted.get(key) else {
            return Vec::new();
        };
        let mut due: Vec<(i64, &String)> = zset
            .iter()
            .filter(|(_, score)| **score <= max)
            .map(|(member, score)| (*score, member))
            .collect();
        due.sort();
        due.into_iter().map(|(_, member)| member.clone()).collect()
    }

    fn srem(&mut self, key: &str, member: &str) {
        if let Some(set) = self.sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                self.sets.remove(key);
            }
        }
    }
}

/// Outcome of a due entry in a promotion sweep.
enum Promotion {
    Dead,
    Ready { record: String, score: i64 },
}

fn field(obj: &serde_json::Map<String, Value>, name: &str) -> Result<i64, StoreError> {
    obj.get(name)
        .and_then(Value::as_i64)
        .ok_or_else(|| StoreError::Script(format!("job record field `{name}` missing or not an integer")))
}

/// Decide what happens to a due record, mirroring the promotion script.
fn promote_record(raw: &str) -> Result<Promotion, StoreError> {
    let mut value: Value = serde_json::from_str(raw)
        .map_err(|e| StoreError::Script(format!("undecodable job record: {e}")))?;
    let obj = value
        .as_object_mut()
        .ok_or_else(|| StoreError::Script("job record is not an object".to_string()))?;

    let done = field(obj, "done")?;
    let retry = field(obj, "retry")?;
    if done > retry {
        return Ok(Promotion::Dead);
    }
    let delay = field(obj, "delay")?;
    let ttr = field(obj, "ttr")?;
    let done = done + 1;
    obj.insert("done".to_string(), Value::from(done));

    Ok(Promotion::Ready {
        record: value.to_string(),
        score: delay.saturating_add(ttr.saturating_mul(done)),
    })
}

/// In-memory coordination store (for testing and single-process use)
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<Keyspace>,
    pushed: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Score of `member` in a sorted set, if present.
    pub async fn score(&self, key: &str, member: &str) -> Option<i64> {
        let data = self.data.lock().await;
        data.sorted.get(key).and_then(|zset| zset.get(member)).copied()
    }

    /// Whether `member` belongs to a set.
    pub async fn is_member(&self, key: &str, member: &str) -> bool {
        let data = self.data.lock().await;
        data.sets.get(key).is_some_and(|set| set.contains(member))
    }

    /// Current length of a list.
    pub async fn list_len(&self, key: &str) -> usize {
        let data = self.data.lock().await;
        data.lists.get(key).map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl CoordStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn is_healthy(&self) -> bool {
        true
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut data = self.data.lock().await;
        if data.live_value(key).is_some() {
            return Ok(false);
        }
        data.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: Instant::now().checked_add(ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut data = self.data.lock().await;
        if data.live_value(key) != Some(expected) {
            return Ok(false);
        }
        data.strings.remove(key);
        Ok(true)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut data = self.data.lock().await;
        if data.live_value(key) != Some(expected) {
            return Ok(false);
        }
        if let Some(entry) = data.strings.get_mut(key) {
            entry.expires_at = Instant::now().checked_add(ttl);
        }
        Ok(true)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        let mut data = self.data.lock().await;
        Ok(keys
            .iter()
            .map(|key| data.live_value(key).map(str::to_string))
            .collect())
    }

    async fn random_members(&self, key: &str, count: usize) -> Result<Vec<String>, StoreError> {
        let data = self.data.lock().await;
        let Some(set) = data.sets.get(key) else {
            return Ok(Vec::new());
        };
        Ok(set
            .iter()
            .cloned()
            .choose_multiple(&mut rand::rng(), count))
    }

    async fn pop_ready(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, StoreError> {
        // None: the timeout is past the clock's range, wait indefinitely.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            // Register interest before looking, so a push in between is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut data = self.data.lock().await;
                for key in keys {
                    let Some(list) = data.lists.get_mut(key) else {
                        continue;
                    };
                    if let Some(element) = list.pop_back() {
                        if list.is_empty() {
                            data.lists.remove(key);
                        }
                        return Ok(Some((key.clone(), element)));
                    }
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn schedule(&self, entries: &[ScheduleEntry]) -> Result<(), StoreError> {
        let mut data = self.data.lock().await;
        for entry in entries {
            data.strings.insert(
                entry.pool_key.clone(),
                StringEntry {
                    value: entry.record.clone(),
                    expires_at: None,
                },
            );
            data.zadd(&entry.index_key, &entry.pool_key, entry.score);
        }
        Ok(())
    }

    async fn unschedule(&self, entries: &[UnscheduleEntry]) -> Result<(), StoreError> {
        let mut data = self.data.lock().await;
        for entry in entries {
            data.zrem(&entry.index_key, &entry.pool_key);
            data.srem(&entry.dead_key, &entry.pool_key);
            data.strings.remove(&entry.pool_key);
        }
        Ok(())
    }

    async fn promote_due(&self, keys: &SweepKeys, now: i64) -> Result<usize, StoreError> {
        let mut data = self.data.lock().await;

        // Decide everything first so a corrupt record leaves the keyspace untouched.
        let due = data.zrange_to(&keys.index_key, now);
        let mut plan = Vec::with_capacity(due.len());
        for member in due {
            let outcome = match data.live_value(&member) {
                Some(raw) => Some(promote_record(raw)?),
                None => None,
            };
            plan.push((member, outcome));
        }

        let mut handled = 0;
        let mut pushed = false;
        for (member, outcome) in plan {
            match outcome {
                None => data.zrem(&keys.index_key, &member),
                Some(Promotion::Dead) => {
                    data.sets
                        .entry(keys.dead_key.clone())
                        .or_default()
                        .insert(member.clone());
                    data.zrem(&keys.index_key, &member);
                    handled += 1;
                }
                Some(Promotion::Ready { record, score }) => {
                    data.zadd(&keys.index_key, &member, score);
                    data.strings.insert(
                        member.clone(),
                        StringEntry {
                            value: record,
                            expires_at: None,
                        },
                    );
                    data.lists
                        .entry(keys.ready_key.clone())
                        .or_default()
                        .push_front(member);
                    pushed = true;
                    handled += 1;
                }
            }
        }
        drop(data);

        if pushed {
            self.pushed.notify_waiters();
        }
        Ok(handled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sweep_keys() -> SweepKeys {
        SweepKeys {
            index_key: "ns:orders".to_string(),
            ready_key: "ns:ready_orders".to_string(),
            dead_key: "ns:error_orders".to_string(),
        }
    }

    fn record(delay: i64, retry: i64, ttr: i64) -> String {
        serde_json::json!({
            "topic": "orders", "id": "1", "delay": delay, "body": "{}",
            "retry": retry, "ttr": ttr, "done": 0
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_set_if_absent_respects_ttl() {
        let store = MemoryStore::new();
        assert!(store.set_if_absent("k", "a", Duration::from_millis(30)).await.unwrap());
        assert!(!store.set_if_absent("k", "b", Duration::from_millis(30)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.set_if_absent("k", "b", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_unrepresentable_ttl_never_expires() {
        let store = MemoryStore::new();
        assert!(store.set_if_absent("k", "a", Duration::MAX).await.unwrap());
        assert!(store.compare_and_expire("k", "a", Duration::MAX).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));

        let keys = sweep_keys();
        store
            .schedule(&[ScheduleEntry {
                pool_key: "x".to_string(),
                record: record(1, 1, 10),
                index_key: keys.index_key.clone(),
                score: 1,
            }])
            .await
            .unwrap();
        store.promote_due(&keys, 1).await.unwrap();
        let lists = vec![keys.ready_key.clone()];
        let popped = store.pop_ready(&lists, Duration::MAX).await.unwrap();
        assert_eq!(popped, Some((keys.ready_key.clone(), "x".to_string())));
    }

    #[tokio::test]
    async fn test_compare_and_delete() {
        let store = MemoryStore::new();
        store.set_if_absent("k", "mine", Duration::from_secs(5)).await.unwrap();

        assert!(!store.compare_and_delete("k", "theirs").await.unwrap());
        assert!(store.get("k").await.unwrap().is_some());
        assert!(store.compare_and_delete("k", "mine").await.unwrap());
        assert!(!store.compare_and_delete("k", "mine").await.unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_expire_extends_lease() {
        let store = MemoryStore::new();
        store.set_if_absent("k", "mine", Duration::from_millis(40)).await.unwrap();
        assert!(!store.compare_and_expire("k", "theirs", Duration::from_secs(5)).await.unwrap());
        assert!(store.compare_and_expire("k", "mine", Duration::from_secs(5)).await.unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("mine"));
    }

    #[tokio::test]
    async fn test_promotion_schedule_is_linear_in_ttr() {
        let store = MemoryStore::new();
        let keys = sweep_keys();
        let pool_key = "ns:pool_orders:1".to_string();
        store
            .schedule(&[ScheduleEntry {
                pool_key: pool_key.clone(),
                record: record(1000, 2, 5),
                index_key: keys.index_key.clone(),
                score: 1000,
            }])
            .await
            .unwrap();

        assert_eq!(store.promote_due(&keys, 999).await.unwrap(), 0);

        // done: 0 -> 1, next due at 1000 + 5*1
        assert_eq!(store.promote_due(&keys, 1000).await.unwrap(), 1);
        assert_eq!(store.score(&keys.index_key, &pool_key).await, Some(1005));
        assert_eq!(store.list_len(&keys.ready_key).await, 1);

        assert_eq!(store.promote_due(&keys, 1004).await.unwrap(), 0);
        assert_eq!(store.promote_due(&keys, 1005).await.unwrap(), 1);
        assert_eq!(store.score(&keys.index_key, &pool_key).await, Some(1010));
        assert_eq!(store.promote_due(&keys, 1010).await.unwrap(), 1);
        assert_eq!(store.score(&keys.index_key, &pool_key).await, Some(1015));
        assert_eq!(store.list_len(&keys.ready_key).await, 3);

        // done = 3 > retry = 2
        assert_eq!(store.promote_due(&keys, 1015).await.unwrap(), 1);
        assert_eq!(store.score(&keys.index_key, &pool_key).await, None);
        assert!(store.is_member(&keys.dead_key, &pool_key).await);
        assert_eq!(store.list_len(&keys.ready_key).await, 3);

        let raw = store.get(&pool_key).await.unwrap().unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["done"], 3);
    }

    #[tokio::test]
    async fn test_promotion_drops_vanished_records() {
        let store = MemoryStore::new();
        let keys = sweep_keys();
        {
            let mut data = store.data.lock().await;
            data.zadd(&keys.index_key, "ns:pool_orders:gone", 10);
        }
        assert_eq!(store.promote_due(&keys, 10).await.unwrap(), 0);
        assert_eq!(store.score(&keys.index_key, "ns:pool_orders:gone").await, None);
        assert_eq!(store.list_len(&keys.ready_key).await, 0);
    }

    #[tokio::test]
    async fn test_promotion_rejects_corrupt_record_atomically() {
        let store = MemoryStore::new();
        let keys = sweep_keys();
        store
            .schedule(&[
                ScheduleEntry {
                    pool_key: "ns:pool_orders:1".to_string(),
                    record: record(1, 0, 1),
                    index_key: keys.index_key.clone(),
                    score: 1,
                },
                ScheduleEntry {
                    pool_key: "ns:pool_orders:2".to_string(),
                    record: "not json".to_string(),
                    index_key: keys.index_key.clone(),
                    score: 2,
                },
            ])
            .await
            .unwrap();

        let err = store.promote_due(&keys, 5).await.unwrap_err();
        assert!(matches!(err, StoreError::Script(_)));
        assert_eq!(store.list_len(&keys.ready_key).await, 0);
        assert_eq!(store.score(&keys.index_key, "ns:pool_orders:1").await, Some(1));
    }

    #[tokio::test]
    async fn test_unschedule_clears_index_dead_set_and_pool() {
        let store = MemoryStore::new();
        let keys = sweep_keys();
        let pool_key = "ns:pool_orders:1".to_string();
        store
            .schedule(&[ScheduleEntry {
                pool_key: pool_key.clone(),
                record: record(1, 0, 1),
                index_key: keys.index_key.clone(),
                score: 1,
            }])
            .await
            .unwrap();
        store.promote_due(&keys, 1).await.unwrap();
        store.promote_due(&keys, 2).await.unwrap();
        assert!(store.is_member(&keys.dead_key, &pool_key).await);

        store
            .unschedule(&[UnscheduleEntry {
                pool_key: pool_key.clone(),
                index_key: keys.index_key.clone(),
                dead_key: keys.dead_key.clone(),
            }])
            .await
            .unwrap();
        assert!(!store.is_member(&keys.dead_key, &pool_key).await);
        assert_eq!(store.score(&keys.index_key, &pool_key).await, None);
        assert_eq!(store.get(&pool_key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pop_ready_is_fifo_and_times_out() {
        let store = MemoryStore::new();
        let keys = sweep_keys();
        for (id, score) in [("a", 1), ("b", 2)] {
            store
                .schedule(&[ScheduleEntry {
                    pool_key: id.to_string(),
                    record: record(score, 1, 10),
                    index_key: keys.index_key.clone(),
                    score,
                }])
                .await
                .unwrap();
        }
        store.promote_due(&keys, 2).await.unwrap();

        let lists = vec!["other".to_string(), keys.ready_key.clone()];
        let first = store.pop_ready(&lists, Duration::from_millis(10)).await.unwrap();
        assert_eq!(first, Some((keys.ready_key.clone(), "a".to_string())));
        let second = store.pop_ready(&lists, Duration::from_millis(10)).await.unwrap();
        assert_eq!(second, Some((keys.ready_key.clone(), "b".to_string())));

        let started = Instant::now();
        let none = store.pop_ready(&lists, Duration::from_millis(30)).await.unwrap();
        assert_eq!(none, None);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_pop_ready_wakes_on_push() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let keys = sweep_keys();
        store
            .schedule(&[ScheduleEntry {
                pool_key: "a".to_string(),
                record: record(1, 1, 10),
                index_key: keys.index_key.clone(),
                score: 1,
            }])
            .await
            .unwrap();

        let waiter = {
            let store = store.clone();
            let lists = vec![keys.ready_key.clone()];
            tokio::spawn(async move { store.pop_ready(&lists, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.promote_due(&keys, 1).await.unwrap();

        let popped = waiter.await.unwrap().unwrap();
        assert_eq!(popped.map(|(_, member)| member), Some("a".to_string()));
    }

    #[tokio::test]
    async fn test_random_members_bounded_by_count() {
        let store = MemoryStore::new();
        {
            let mut data = store.data.lock().await;
            let set = data.sets.entry("dead".to_string()).or_default();
            for i in 0..5 {
                set.insert(format!("job-{i}"));
            }
        }
        let sample = store.random_members("dead", 3).await.unwrap();
        assert_eq!(sample.len(), 3);
        let unique: HashSet<_> = sample.iter().collect();
        assert_eq!(unique.len(), 3);

        assert_eq!(store.random_members("dead", 10).await.unwrap().len(), 5);
        assert!(store.random_members("missing", 3).await.unwrap().is_empty());
    }
}
