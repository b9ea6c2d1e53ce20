//! Error types shared by the bridge crates
//!
//! Variants carry the job or record they concern so log lines stay useful
//! without extra context.

use thiserror::Error;

/// Main error type for bridge operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A BridgeJob spec or credential failed validation
    #[error("validation error for {job}: {message}")]
    Validation {
        /// Name of the offending job
        job: String,
        /// Description of what's invalid
        message: String,
    },

    /// The coordination record is missing or malformed
    #[error("coordination record {record}: {message}")]
    Record {
        /// Record (ConfigMap) name
        record: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g. "telemetry", "record-store")
        context: String,
    },
}

impl Error {
    /// Create a validation error for the named job
    pub fn validation(job: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            job: job.into(),
            message: msg.into(),
        }
    }

    /// Create a record error for the named coordination record
    pub fn record(record: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Record {
            record: record.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True when the error is a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
