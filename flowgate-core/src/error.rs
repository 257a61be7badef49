use thiserror::Error;

/// Errors raised while admitting a request into the queue.
#[derive(Debug, Clone, Error)]
pub enum AdmissionError {
    #[error("admission queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },
}

/// Errors surfaced by the throttler while acquiring a replica slot.
#[derive(Debug, Clone, Error)]
pub enum ThrottlerError {
    #[error("timed out waiting for a free replica")]
    DeadlineExceeded,

    #[error("throttler request queue is full")]
    QueueFull,

    #[error("no replicas registered for revision {0}")]
    NoReplicas(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A failure while proxying a request to its chosen replica.
#[derive(Debug, Clone, Error)]
#[error("proxy to {dest} failed: {message}")]
pub struct TransportError {
    pub dest: String,
    pub message: String,
}

impl TransportError {
    pub fn new(dest: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            dest: dest.into(),
            message: message.into(),
        }
    }
}

/// Terminal outcome delivered through a unit's completion channel when the
/// request could not be served.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("throttler deadline exceeded")]
    ThrottlerDeadline,

    #[error("throttler failure: {0}")]
    Throttler(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl DispatchError {
    /// HTTP status the frontend should serve for this failure.
    pub fn status_code(&self) -> u16 {
        match self {
            // Queue-full and capacity deadlines are overload, not faults.
            Self::Admission(_) | Self::ThrottlerDeadline => 503,
            Self::Throttler(_) => 500,
            Self::Transport(_) => 502,
        }
    }
}

impl From<ThrottlerError> for DispatchError {
    fn from(err: ThrottlerError) -> Self {
        match err {
            // Both are overload conditions the client should back off from.
            ThrottlerError::DeadlineExceeded | ThrottlerError::QueueFull => {
                Self::ThrottlerDeadline
            }
            ThrottlerError::Transport(t) => Self::Transport(t),
            other => Self::Throttler(other.to_string()),
        }
    }
}
