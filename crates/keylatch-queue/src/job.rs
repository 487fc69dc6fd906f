//! Job definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::QueueError;

/// Job identifier: unique within its topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId {
    pub topic: String,
    pub id: String,
}

impl JobId {
    pub fn new(topic: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.topic, self.id)
    }
}

/// A delayed job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub topic: String,
    pub id: String,
    /// First execution time, unix seconds
    pub delay: i64,
    /// Opaque payload
    pub body: String,
    /// Redeliveries allowed after the first delivery
    pub retry: u32,
    /// Time to run in seconds: how long a delivered job may stay
    /// uncommitted before it is delivered again
    pub ttr: u64,
}

impl Job {
    /// A job due now, with no retries and a 60 second time-to-run.
    pub fn new(topic: impl Into<String>, id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            id: id.into(),
            delay: Utc::now().timestamp(),
            body: body.into(),
            retry: 0,
            ttr: 60,
        }
    }

    /// Run at an absolute time.
    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.delay = at.timestamp();
        self
    }

    /// Run `after` from now (second resolution).
    pub fn delay_for(mut self, after: Duration) -> Self {
        let secs = i64::try_from(after.as_secs()).unwrap_or(i64::MAX);
        self.delay = Utc::now().timestamp().saturating_add(secs);
        self
    }

    pub fn retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    pub fn ttr(mut self, ttr: Duration) -> Self {
        self.ttr = ttr.as_secs();
        self
    }

    pub fn job_id(&self) -> JobId {
        JobId::new(self.topic.clone(), self.id.clone())
    }

    /// Execution time as a timestamp, if representable.
    pub fn run_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.delay, 0)
    }

    pub(crate) fn validate(&self) -> Result<(), QueueError> {
        if self.topic.is_empty() {
            return Err(QueueError::InvalidJob("topic cannot be empty".to_string()));
        }
        if self.id.is_empty() {
            return Err(QueueError::InvalidJob(format!(
                "id cannot be empty (topic {})",
                self.topic
            )));
        }
        if self.ttr == 0 {
            return Err(QueueError::InvalidJob(format!(
                "ttr must be greater than 0 (job {}/{})",
                self.topic, self.id
            )));
        }
        Ok(())
    }
}

/// The persisted form of a job: the job plus its delivery count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(flatten)]
    pub job: Job,
    /// Deliveries made so far
    pub done: u32,
}

impl JobRecord {
    pub fn new(job: Job) -> Self {
        Self { job, done: 0 }
    }
}
