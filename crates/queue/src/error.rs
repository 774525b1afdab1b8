//! Error types for the producer and consumer surfaces

use crate::config::ConfigError;
use crate::persistence::StoreError;
use crate::scheduler::SchedulerError;

/// Receive errors
#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The consumer stopped receiving
    #[error("consumer is shutting down")]
    ShuttingDown,
}

impl ReceiveError {
    /// Whether backing off and receiving again may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::ShuttingDown => false,
        }
    }
}

/// Send errors
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("failed to serialize message body: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Consumer lifecycle errors
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("consumer is already running")]
    AlreadyRunning,

    /// A consumer cannot be restarted after shutdown
    #[error("consumer has been shut down")]
    Stopped,

    /// Work still running when the shutdown timeout passed was canceled
    #[error("graceful shutdown timed out with {remaining} messages in flight")]
    ShutdownTimeout { remaining: usize },
}

/// Any error raised by this crate
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Receive(#[from] ReceiveError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Consumer(#[from] ConsumerError),
}
