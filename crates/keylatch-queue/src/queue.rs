//! Delay queue over a coordination store
//!
//! Jobs are written to a per-topic schedule index scored by their due second.
//! One background task per listened topic promotes due entries to the topic's
//! ready list every `poll_interval`, bumping the delivery count and
//! rescheduling the job `ttr` seconds later in case it is never committed.
//! Jobs that ran out of retries go to the topic's dead-letter set instead.
//! A single reader task blocks on all ready lists and hands jobs to
//! [`JobReader`]s through a one-slot channel.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use keylatch_store::{CoordStore, ScheduleEntry};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::QueueError;
use crate::job::{Job, JobId, JobRecord};
use crate::keys::KeySpace;

/// Receives every background-loop error.
pub type ErrorCallback = Arc<dyn Fn(&QueueError) + Send + Sync>;

/// Delay queue configuration
#[derive(Clone)]
pub struct DelayQueueConfig {
    /// Prefix of every key the queue touches
    pub namespace: String,
    /// Topics to listen on from the start
    pub topics: Vec<String>,
    /// Promotion sweep period
    pub poll_interval: Duration,
    /// Blocking pop timeout of the reader task
    pub pop_timeout: Duration,
    pub on_error: Option<ErrorCallback>,
}

impl Default for DelayQueueConfig {
    fn default() -> Self {
        Self {
            namespace: "delay".to_string(),
            topics: Vec::new(),
            poll_interval: Duration::from_secs(1),
            pop_timeout: Duration::from_secs(10),
            on_error: None,
        }
    }
}

impl std::fmt::Debug for DelayQueueConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayQueueConfig")
            .field("namespace", &self.namespace)
            .field("topics", &self.topics)
            .field("poll_interval", &self.poll_interval)
            .field("pop_timeout", &self.pop_timeout)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl DelayQueueConfig {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.push(topic.into());
        self
    }

    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics.extend(topics.into_iter().map(Into::into));
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn pop_timeout(mut self, timeout: Duration) -> Self {
        self.pop_timeout = timeout;
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&QueueError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

/// State shared with the background tasks.
struct Shared {
    store: Arc<dyn CoordStore>,
    keys: KeySpace,
    poll_interval: Duration,
    pop_timeout: Duration,
    on_error: Option<ErrorCallback>,
    /// Topics with a sweep in flight
    sweeping: StdMutex<HashSet<String>>,
}

impl Shared {
    fn report(&self, err: QueueError) {
        error!(namespace = %self.keys.namespace(), error = %err, "delay queue background error");
        if let Some(callback) = &self.on_error {
            callback(&err);
        }
    }

    /// MGET the given pool keys. Missing keys are skipped.
    async fn load(&self, pool_keys: &[String]) -> Result<Vec<Job>, QueueError> {
        if pool_keys.is_empty() {
            return Ok(Vec::new());
        }
        let raw = self.store.get_many(pool_keys).await?;
        let mut jobs = Vec::with_capacity(raw.len());
        for (key, value) in pool_keys.iter().zip(raw) {
            let Some(value) = value else { continue };
            let record: JobRecord =
                serde_json::from_str(&value).map_err(|source| QueueError::Decode {
                    key: key.clone(),
                    source,
                })?;
            jobs.push(record.job);
        }
        Ok(jobs)
    }

    /// One promotion sweep of `topic`. `None` when another sweep of the same
    /// topic is still running.
    async fn promote(&self, topic: &str) -> Result<Option<usize>, QueueError> {
        let Some(_guard) = SweepGuard::enter(&self.sweeping, topic) else {
            trace!(topic, "promotion sweep already running, skipped");
            return Ok(None);
        };
        let now = Utc::now().timestamp();
        let handled = self.store.promote_due(&self.keys.sweep(topic), now).await?;
        if handled > 0 {
            debug!(topic, handled, "promoted due jobs");
        }
        Ok(Some(handled))
    }
}

/// Marks a topic as being swept until dropped.
struct SweepGuard<'a> {
    set: &'a StdMutex<HashSet<String>>,
    topic: String,
}

impl<'a> SweepGuard<'a> {
    fn enter(set: &'a StdMutex<HashSet<String>>, topic: &str) -> Option<Self> {
        let mut active = set.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(topic.to_string()) {
            return None;
        }
        Some(Self {
            set,
            topic: topic.to_string(),
        })
    }
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.set.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&self.topic);
    }
}

/// Consumer handle for delivered jobs
///
/// Clones share one channel: each job goes to exactly one of them.
#[derive(Debug, Clone)]
pub struct JobReader {
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
}

impl JobReader {
    /// Next delivered job, or `None` once the queue has shut down.
    pub async fn recv(&self) -> Option<Job> {
        self.rx.lock().await.recv().await
    }
}

struct Listener {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Delay queue with background promotion and delivery
///
/// Must be created inside a Tokio runtime. Dropping the queue stops its
/// background tasks; [`DelayQueue::shutdown`] also waits for them.
pub struct DelayQueue {
    shared: Arc<Shared>,
    reader: JobReader,
    ready_keys: watch::Sender<Vec<String>>,
    listeners: Mutex<HashMap<String, Listener>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for DelayQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayQueue")
            .field("namespace", &self.shared.keys.namespace())
            .field("store", &self.shared.store.name())
            .finish()
    }
}

impl DelayQueue {
    /// Create the queue and start listening on `config.topics`.
    pub fn new(store: Arc<dyn CoordStore>, config: DelayQueueConfig) -> Self {
        let shared = Arc::new(Shared {
            store,
            keys: KeySpace::new(config.namespace),
            poll_interval: config.poll_interval,
            pop_timeout: config.pop_timeout,
            on_error: config.on_error,
            sweeping: StdMutex::new(HashSet::new()),
        });
        let shutdown = CancellationToken::new();

        let mut listeners = HashMap::new();
        let mut ready_keys = Vec::new();
        for topic in config.topics {
            if topic.is_empty() || listeners.contains_key(&topic) {
                continue;
            }
            ready_keys.push(shared.keys.ready(&topic));
            let listener = spawn_promoter(shared.clone(), topic.clone(), shutdown.child_token());
            listeners.insert(topic, listener);
        }

        let (keys_tx, keys_rx) = watch::channel(ready_keys);
        let (jobs_tx, jobs_rx) = mpsc::channel(1);
        let reader_task = tokio::spawn(run_reader(
            shared.clone(),
            keys_rx,
            jobs_tx,
            shutdown.child_token(),
        ));

        info!(
            namespace = %shared.keys.namespace(),
            topics = listeners.len(),
            "delay queue started"
        );

        Self {
            shared,
            reader: JobReader {
                rx: Arc::new(Mutex::new(jobs_rx)),
            },
            ready_keys: keys_tx,
            listeners: Mutex::new(listeners),
            reader_task: Mutex::new(Some(reader_task)),
            shutdown,
        }
    }

    pub fn keys(&self) -> &KeySpace {
        &self.shared.keys
    }

    /// Insert or replace jobs. Every job is validated before anything is
    /// written; the delivery count restarts at zero.
    pub async fn upsert(&self, jobs: &[Job]) -> Result<(), QueueError> {
        for job in jobs {
            job.validate()?;
        }
        let mut entries = Vec::with_capacity(jobs.len());
        for job in jobs {
            entries.push(ScheduleEntry {
                pool_key: self.shared.keys.pool(&job.topic, &job.id),
                record: serde_json::to_string(&JobRecord::new(job.clone()))?,
                index_key: self.shared.keys.index(&job.topic),
                score: job.delay,
            });
        }
        if entries.is_empty() {
            return Ok(());
        }
        self.shared.store.schedule(&entries).await?;
        debug!(count = entries.len(), "jobs upserted");
        Ok(())
    }

    /// Remove jobs from the schedule index, the dead-letter set and the pool.
    /// Unknown ids are ignored.
    pub async fn delete(&self, ids: &[JobId]) -> Result<(), QueueError> {
        if ids.is_empty() {
            return Ok(());
        }
        let entries: Vec<_> = ids.iter().map(|id| self.shared.keys.unschedule(id)).collect();
        self.shared.store.unschedule(&entries).await?;
        debug!(count = entries.len(), "jobs deleted");
        Ok(())
    }

    /// Acknowledge processed jobs so they are not delivered again.
    pub async fn commit(&self, ids: &[JobId]) -> Result<(), QueueError> {
        self.delete(ids).await
    }

    /// Drop dead-lettered jobs for good.
    pub async fn remove_error_jobs(&self, ids: &[JobId]) -> Result<(), QueueError> {
        self.delete(ids).await
    }

    /// Fetch jobs by id. Ids with no stored job are left out of the result.
    pub async fn get(&self, ids: &[JobId]) -> Result<Vec<Job>, QueueError> {
        let keys: Vec<String> = ids
            .iter()
            .map(|id| self.shared.keys.pool(&id.topic, &id.id))
            .collect();
        self.shared.load(&keys).await
    }

    /// Up to `count` distinct jobs sampled from the topic's dead-letter set.
    pub async fn random_error_jobs(&self, topic: &str, count: usize) -> Result<Vec<Job>, QueueError> {
        let keys = self
            .shared
            .store
            .random_members(&self.shared.keys.dead(topic), count)
            .await?;
        self.shared.load(&keys).await
    }

    pub fn reader(&self) -> JobReader {
        self.reader.clone()
    }

    /// Run one promotion sweep now. Returns the number of promoted or
    /// dead-lettered jobs, or 0 if a sweep of the topic was already running.
    pub async fn promote(&self, topic: &str) -> Result<usize, QueueError> {
        Ok(self.shared.promote(topic).await?.unwrap_or(0))
    }

    /// Start promoting and delivering `topic`. No-op if already listening.
    ///
    /// Fails with [`QueueError::ShutDown`] once the queue has been shut down.
    pub async fn listen(&self, topic: &str) -> Result<(), QueueError> {
        if topic.is_empty() {
            return Err(QueueError::InvalidJob("topic cannot be empty".to_string()));
        }
        if self.shutdown.is_cancelled() {
            return Err(QueueError::ShutDown);
        }
        let mut listeners = self.listeners.lock().await;
        if listeners.contains_key(topic) {
            return Ok(());
        }
        let listener = spawn_promoter(
            self.shared.clone(),
            topic.to_string(),
            self.shutdown.child_token(),
        );
        listeners.insert(topic.to_string(), listener);

        let ready = self.shared.keys.ready(topic);
        self.ready_keys.send_modify(|keys| keys.push(ready));
        info!(topic, "listening");
        Ok(())
    }

    /// Stop promoting and delivering `topic`. Jobs stay stored.
    ///
    /// A ready entry the reader pops for `topic` afterwards is dropped
    /// instead of delivered; its job was already rescheduled and comes back
    /// after `ttr` once the topic is listened to again.
    pub async fn unlisten(&self, topic: &str) {
        let listener = self.listeners.lock().await.remove(topic);
        let Some(listener) = listener else { return };

        let ready = self.shared.keys.ready(topic);
        self.ready_keys.send_modify(|keys| keys.retain(|k| *k != ready));

        listener.cancel.cancel();
        if let Err(e) = listener.handle.await {
            warn!(topic, error = %e, "promotion task ended abnormally");
        }
        info!(topic, "stopped listening");
    }

    /// Topics currently listened on.
    pub async fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.listeners.lock().await.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Stop every background task and wait for them. Readers see `None`
    /// once buffered jobs are drained.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let listeners: Vec<_> = self.listeners.lock().await.drain().collect();
        for (topic, listener) in listeners {
            if let Err(e) = listener.handle.await {
                warn!(topic = %topic, error = %e, "promotion task ended abnormally");
            }
        }
        if let Some(handle) = self.reader_task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "reader task ended abnormally");
            }
        }
        info!(namespace = %self.shared.keys.namespace(), "delay queue stopped");
    }
}

impl Drop for DelayQueue {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn spawn_promoter(shared: Arc<Shared>, topic: String, cancel: CancellationToken) -> Listener {
    let handle = tokio::spawn(run_promoter(shared, topic, cancel.clone()));
    Listener { cancel, handle }
}

async fn run_promoter(shared: Arc<Shared>, topic: String, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = shared.promote(&topic).await {
            let err = match e {
                QueueError::Store(source) => QueueError::ListenTopic {
                    topic: topic.clone(),
                    source,
                },
                other => other,
            };
            shared.report(err);
        }
    }
    trace!(topic = %topic, "promotion task exited");
}

async fn run_reader(
    shared: Arc<Shared>,
    mut ready_keys: watch::Receiver<Vec<String>>,
    jobs: mpsc::Sender<Job>,
    cancel: CancellationToken,
) {
    loop {
        let keys = ready_keys.borrow_and_update().clone();
        if keys.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = ready_keys.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }
        }

        let popped = tokio::select! {
            _ = cancel.cancelled() => break,
            popped = shared.store.pop_ready(&keys, shared.pop_timeout) => popped,
        };

        let pool_key = match popped {
            Ok(Some((list_key, pool_key))) => {
                if !ready_keys.borrow().contains(&list_key) {
                    trace!(key = %pool_key, list = %list_key, "popped after unlisten, dropped");
                    continue;
                }
                pool_key
            }
            Ok(None) => continue,
            Err(e) => {
                shared.report(QueueError::ListenReady(e));
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(shared.poll_interval) => {}
                }
                continue;
            }
        };

        let job = match shared.load(std::slice::from_ref(&pool_key)).await {
            Ok(mut loaded) => match loaded.pop() {
                Some(job) => job,
                None => {
                    trace!(key = %pool_key, "ready job deleted before delivery");
                    continue;
                }
            },
            Err(e) => {
                shared.report(e);
                continue;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = jobs.send(job) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    trace!("reader task exited");
}
