//! Watcher error types
//!
//! Backend and storage failures are soft from the engine's point of view: a
//! failed poll or upload is logged and retried on the next cycle. Only
//! [`WatcherError`] variants raised at startup end the process.

use thiserror::Error;

/// Failure talking to a remote scheduler
#[derive(Debug, Error)]
pub enum BackendError {
    /// Connection, timeout or body read failure
    #[error("transport error during {operation}: {source}")]
    Transport {
        /// What was being attempted
        operation: &'static str,
        /// Underlying client error
        source: reqwest::Error,
    },

    /// Remote answered with a non-success status
    #[error("{operation} returned HTTP {status}: {body}")]
    Status {
        /// What was being attempted
        operation: &'static str,
        /// HTTP status code
        status: u16,
        /// Response body, for the log
        body: String,
    },

    /// Remote answered but the body was not understood
    #[error("invalid response to {operation}: {message}")]
    InvalidResponse {
        /// What was being attempted
        operation: &'static str,
        /// What was wrong with it
        message: String,
    },

    /// Login or session handling failed
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Remote accepted the request but refused the job
    #[error("job rejected: {0}")]
    Rejected(String),

    /// Operation has no counterpart on this backend
    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),

    /// Local staging file could not be read or written
    #[error("staging file {path}: {source}")]
    Io {
        /// File concerned
        path: String,
        /// Underlying error
        source: std::io::Error,
    },
}

impl BackendError {
    /// Wrap a client error for `operation`
    pub fn transport(operation: &'static str, source: reqwest::Error) -> Self {
        Self::Transport { operation, source }
    }

    /// Describe an unexpected body for `operation`
    pub fn invalid(operation: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            operation,
            message: message.into(),
        }
    }

    /// Wrap an I/O error on a staging file
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failure talking to object storage
#[derive(Debug, Error)]
pub enum StorageError {
    /// S3 client error
    #[error("object storage error: {0}")]
    S3(#[from] s3::error::S3Error),

    /// Storage credentials could not be used
    #[error("object storage credentials: {0}")]
    Credentials(String),

    /// A `bucket:object` reference was malformed
    #[error("invalid object location '{0}', expected bucket:object")]
    InvalidLocation(String),

    /// Staging directory read or write failed
    #[error("staging file {path}: {source}")]
    Io {
        /// File concerned
        path: String,
        /// Underlying error
        source: std::io::Error,
    },
}

/// Fatal watcher failure
#[derive(Debug, Error)]
pub enum WatcherError {
    /// Coordination record could not be read or written
    #[error("{0}")]
    Record(#[from] bridge_common::Error),

    /// Settings or credentials were incomplete
    #[error("configuration error: {0}")]
    Config(String),

    /// Remote scheduler failure that cannot be retried
    #[error("{0}")]
    Backend(#[from] BackendError),

    /// Object storage failure that cannot be retried
    #[error("{0}")]
    Storage(#[from] StorageError),
}

impl WatcherError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// Result alias for watcher operations
pub type Result<T, E = WatcherError> = std::result::Result<T, E>;
