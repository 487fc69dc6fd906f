//! Store key layout
//!
//! For namespace `N`, topic `T` and job id `I`:
//!
//! | key            | type       | content                          |
//! |----------------|------------|----------------------------------|
//! | `N:pool_T:I`   | string     | job record JSON                  |
//! | `N:T`          | sorted set | pool keys scored by due second   |
//! | `N:ready_T`    | list       | pool keys waiting for a reader   |
//! | `N:error_T`    | set        | pool keys past their retry limit |

use keylatch_store::{SweepKeys, UnscheduleEntry};

use crate::job::JobId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn pool(&self, topic: &str, id: &str) -> String {
        format!("{}:pool_{}:{}", self.namespace, topic, id)
    }

    pub fn index(&self, topic: &str) -> String {
        format!("{}:{}", self.namespace, topic)
    }

    pub fn ready(&self, topic: &str) -> String {
        format!("{}:ready_{}", self.namespace, topic)
    }

    pub fn dead(&self, topic: &str) -> String {
        format!("{}:error_{}", self.namespace, topic)
    }

    pub fn sweep(&self, topic: &str) -> SweepKeys {
        SweepKeys {
            index_key: self.index(topic),
            ready_key: self.ready(topic),
            dead_key: self.dead(topic),
        }
    }

    pub fn unschedule(&self, id: &JobId) -> UnscheduleEntry {
        UnscheduleEntry {
            pool_key: self.pool(&id.topic, &id.id),
            index_key: self.index(&id.topic),
            dead_key: self.dead(&id.topic),
        }
    }
}
