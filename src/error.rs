use std::time::Duration;
use thiserror::Error;

/// Reasons a `try_lock` call can fail.
///
/// Errors coming from the coordination service are carried as-is in
/// `SessionCreate` and `Lock`; their `Display` is the service's own message.
#[derive(Debug, Error)]
pub enum Error {
    #[error("lock key must not be empty")]
    EmptyKey,

    #[error("lock acquisition cancelled")]
    Cancelled,

    #[error("lock acquisition timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    SessionCreate(anyhow::Error),

    #[error(transparent)]
    Lock(anyhow::Error),

    #[error("session closed")]
    SessionLost,

    #[error("acquisition worker failed: {0}")]
    WorkerFailed(String),
}

impl Error {
    /// Whether calling `try_lock` again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout(_) | Error::SessionCreate(_) | Error::Lock(_) | Error::SessionLost => {
                true
            }
            Error::EmptyKey | Error::Cancelled | Error::WorkerFailed(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
