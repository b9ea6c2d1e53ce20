//! Common types for the job bridge: the BridgeJob CRD, canonical job status,
//! the coordination record shared by controller and watcher, and telemetry.

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod metrics;
pub mod record;
pub mod status;
pub mod telemetry;
pub mod time;

pub use error::Error;
pub use status::{BackendKind, JobStatus};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every server-side write made by the controller
pub const FIELD_MANAGER: &str = "bridge-job-controller";

/// Field manager used by the watcher when it writes the coordination record
pub const WATCHER_FIELD_MANAGER: &str = "bridge-watcher";

/// Suffix appended to the job name to form the coordination record name
pub const RECORD_SUFFIX: &str = "-bridge-cm";

/// Name of the coordination record (ConfigMap) belonging to a job
pub fn record_name(job_name: &str) -> String {
    format!("{job_name}{RECORD_SUFFIX}")
}
