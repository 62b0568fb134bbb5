//! Error types for the watch service.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from watcher operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatchError {
    #[error("Path does not exist: {}", path.display())]
    PathNotFound { path: PathBuf },

    #[error("Cannot read path: {}", path.display())]
    Unreadable { path: PathBuf },

    #[error("No observer found for path: {}", path.display())]
    NotWatching { path: PathBuf },

    #[error("Cannot watch path {}: {reason}", path.display())]
    ActivationFailure { path: PathBuf, reason: String },

    #[error("Failed to start background worker: {reason}")]
    WorkerFailed { reason: String },

    #[error("Watch service has been disposed")]
    Disposed,

    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

impl WatchError {
    pub(crate) fn activation(path: &std::path::Path, reason: impl ToString) -> Self {
        WatchError::ActivationFailure {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

pub type WatchResult<T> = Result<T, WatchError>;
