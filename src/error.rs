//! Boundary error type for transfer operations.

use thiserror::Error;
use xfer_tasks::TaskError;

use crate::config::ConfigError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by [`TransferApi`](crate::TransferApi) and the executor.
#[derive(Error, Debug)]
pub enum Error {
    /// Coordination failure reported by the task registry or state store.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Chunk I/O failed mid-transfer.
    ///
    /// The task record is kept; a later run resumes from `progress`.
    #[error("transfer {task_id} failed after {progress} units: {source}")]
    TransferFailed {
        /// The task whose run failed
        task_id: String,
        /// Last persisted progress
        progress: u64,
        /// The I/O error that stopped the run
        #[source]
        source: std::io::Error,
    },

    /// A file filter could not be compiled.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// A filename or owner would escape the owner's data directory.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Storage or metadata I/O outside of a running transfer.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl Error {
    /// Maps this error to the HTTP status a boundary layer should return.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Task(e) => e.status_code(),
            Self::InvalidFilter(_) | Self::InvalidPath(_) => 400,
            Self::TransferFailed { .. } | Self::Config(_) | Self::Storage(_) => 500,
        }
    }

    /// Returns the coordination error, if this is one.
    pub fn as_task_error(&self) -> Option<&TaskError> {
        match self {
            Self::Task(e) => Some(e),
            _ => None,
        }
    }
}
