//! Canonical job status and backend variant tag
//!
//! Every backend maps its native states onto [`JobStatus`]; the controller and
//! the watcher only ever reason about this enumeration.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

// =============================================================================
// JobStatus
// =============================================================================

/// Normalized lifecycle state of a bridged job
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    /// Accepted but not yet submitted to the remote scheduler
    #[default]
    Pending,
    /// Remote scheduler accepted the job
    Submitted,
    /// Remote job is executing
    Running,
    /// Completed successfully (quantum backend)
    Succeeded,
    /// Completed successfully (batch backends)
    Done,
    /// Remote job or its execution context failed
    Failed,
    /// Cancelled on request
    Kill,
    /// State could not be determined; treated as a failure
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    /// All canonical values, in declaration order
    pub const ALL: [JobStatus; 8] = [
        Self::Pending,
        Self::Submitted,
        Self::Running,
        Self::Succeeded,
        Self::Done,
        Self::Failed,
        Self::Kill,
        Self::Unknown,
    ];

    /// String form written to the record and the resource status
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Submitted => "SUBMITTED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Kill => "KILL",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Terminal for the watcher: reaching it ends the poll loop
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Succeeded | Self::Failed | Self::Unknown | Self::Kill
        )
    }

    /// Terminal for the controller: once observed on the resource, reconciles no-op
    ///
    /// `SUCCEEDED` is deliberately absent; see DESIGN.md.
    pub fn halts_reconcile(&self) -> bool {
        matches!(self, Self::Done | Self::Kill | Self::Failed | Self::Unknown)
    }

    /// Successful completion
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Done | Self::Succeeded)
    }

    /// Parse a stored value, mapping anything unrecognized to `UNKNOWN`
    pub fn parse_lenient(value: &str) -> Self {
        value.parse().unwrap_or(Self::Unknown)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == upper)
            .ok_or_else(|| Error::serialization(format!("unknown job status '{s}'")))
    }
}

// =============================================================================
// BackendKind
// =============================================================================

/// Remote scheduler family a job is bridged to
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// IBM Spectrum LSF via the Platform Application Center web services
    Lsf,
    /// SLURM via slurmrestd
    Slurm,
    /// Quantum serverless program runtime
    Quantum,
}

impl BackendKind {
    /// All known backends
    pub const ALL: [BackendKind; 3] = [Self::Lsf, Self::Slurm, Self::Quantum];

    /// Lowercase identifier used in labels and the record
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lsf => "lsf",
            Self::Slurm => "slurm",
            Self::Quantum => "quantum",
        }
    }

    /// Legacy detection from the watcher image name
    ///
    /// Matches the first backend identifier contained in the image reference.
    pub fn from_image(image: &str) -> Option<Self> {
        let image = image.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| image.contains(kind.as_str()))
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == lower)
            .ok_or_else(|| Error::serialization(format!("unknown backend '{s}'")))
    }
}
