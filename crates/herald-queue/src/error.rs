//! Queue error taxonomy

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue configuration error: {0}")]
    Configuration(String),

    #[error("queue is closed")]
    Closed,

    #[error("queue is full")]
    Full,

    #[error("unknown lease: {0}")]
    UnknownLease(u64),
}

pub type Result<T> = std::result::Result<T, QueueError>;
