//! Queue error types

use keylatch_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// A pool record that is not a valid job record
    #[error("Failed to decode job record {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Promotion sweep failure in a topic's background task
    #[error("Listen topic error ({topic}): {source}")]
    ListenTopic {
        topic: String,
        #[source]
        source: StoreError,
    },

    /// Blocking pop failure in the reader task
    #[error("Listen ready error: {0}")]
    ListenReady(#[source] StoreError),

    #[error("Delay queue is shut down")]
    ShutDown,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
