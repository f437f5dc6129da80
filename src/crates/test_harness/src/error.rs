use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result alias for harness operations.
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Errors that abort a harness run.
///
/// A response that does not match its expectation is not an error; it is
/// recorded as a failed [`ExchangeOutcome`](crate::ExchangeOutcome).
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to bind channel at {path}: {source}")]
    Setup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn device: {0}")]
    Spawn(String),
    #[error("device never connected: {0}")]
    Handshake(String),
    #[error("timed out after {0:?} waiting for {1}")]
    Timeout(Duration, &'static str),
    #[error("device connection closed")]
    ConnectionClosed,
    #[error("failed to encode command payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl HarnessError {
    pub(crate) fn setup(path: impl Into<PathBuf>, source: io::Error) -> Self {
        HarnessError::Setup {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn spawn(err: impl Into<String>) -> Self {
        HarnessError::Spawn(err.into())
    }

    pub(crate) fn handshake(message: impl Into<String>) -> Self {
        HarnessError::Handshake(message.into())
    }
}
