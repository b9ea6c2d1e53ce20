//! BridgeJob controller
//!
//! Provisions the execution context of a job (coordination record, watcher
//! pod and the RBAC the watcher needs), relays kill requests into the record,
//! classifies watcher pod failures and projects the record's status onto the
//! resource.

pub mod context;
pub mod controller;
pub mod error;

pub use controller::{error_policy, reconcile, JobContext, KubeClient, KubeClientImpl};
pub use error::JobError;
