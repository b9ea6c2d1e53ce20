//! Backend adapters
//!
//! One [`BackendAdapter`] implementation per remote scheduler protocol. The
//! engine only ever talks to the trait; the concrete adapter is chosen once at
//! startup from the backend tag in the coordination record.

mod lsf;
mod lsf_history;
mod quantum;
mod slurm;

use std::path::Path;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use bridge_common::{BackendKind, JobStatus};

use crate::config::{Credentials, WatcherSettings};
use crate::error::BackendError;

pub use lsf::LsfAdapter;
pub use quantum::QuantumAdapter;
pub use slurm::SlurmAdapter;

/// Job script as handed to an adapter
#[derive(Clone, Debug, PartialEq)]
pub enum ScriptPayload {
    /// Already present on the remote side (path or program name)
    Remote(String),
    /// Script text staged locally
    Content(String),
}

/// Everything needed to submit one job, with object-store references resolved
#[derive(Clone, Debug, PartialEq)]
pub struct SubmitRequest {
    pub job_name: String,
    pub script: ScriptPayload,
    pub metadata: Option<String>,
    pub parameters: Option<String>,
}

/// One observation of the remote job
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobSnapshot {
    /// State as reported by the scheduler
    pub native_state: String,
    pub submit_time: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    /// Remote working directory, when the scheduler reports one
    pub working_dir: Option<String>,
}

impl JobSnapshot {
    /// Snapshot carrying only a native state
    pub fn with_state(native_state: impl Into<String>) -> Self {
        Self {
            native_state: native_state.into(),
            ..Default::default()
        }
    }
}

/// Job state recovered from scheduler history after the live lookup failed
#[derive(Clone, Debug, PartialEq)]
pub struct HistoryEntry {
    pub native_state: String,
    pub time: Option<String>,
}

/// Native state mapped onto the canonical model
#[derive(Clone, Debug, PartialEq)]
pub struct Translation {
    pub status: JobStatus,
    /// Explanation to surface alongside the status
    pub message: Option<String>,
}

impl From<JobStatus> for Translation {
    fn from(status: JobStatus) -> Self {
        Self {
            status,
            message: None,
        }
    }
}

/// Remote scheduler protocol
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Which scheduler this adapter talks to
    fn kind(&self) -> BackendKind;

    /// Establish or refresh the session if the protocol has one
    async fn authenticate(&self) -> Result<(), BackendError>;

    /// Submit a job and return its remote id
    async fn submit(&self, request: &SubmitRequest) -> Result<String, BackendError>;

    /// Look up the current state of a job
    async fn poll(&self, remote_id: &str) -> Result<JobSnapshot, BackendError>;

    /// Recover the state of a job the live lookup no longer knows
    async fn history(&self, _remote_id: &str) -> Result<Option<HistoryEntry>, BackendError> {
        Ok(None)
    }

    /// Cancel a job; already finished jobs are left alone
    async fn cancel(&self, remote_id: &str, native_state: &str) -> Result<(), BackendError>;

    /// Map a native state onto the canonical model; unknown values become `UNKNOWN`
    fn translate(&self, native_state: &str) -> Translation;

    /// Output artifacts to fetch once the job is terminal
    fn output_files(&self) -> Vec<String>;

    /// Fetch one output artifact; `None` when the remote has nothing for it
    async fn fetch_output(&self, remote_id: &str, name: &str)
        -> Result<Option<Vec<u8>>, BackendError>;

    /// Push a staged input file to the remote host before submission
    async fn stage_input(&self, _path: &Path) -> Result<(), BackendError> {
        Ok(())
    }

    /// Message telling the user where outputs ended up
    fn completion_message(&self, _snapshot: &JobSnapshot, _uploaded: bool) -> Option<String> {
        None
    }
}

/// Message written when submission fails
pub fn submit_failure_message(kind: BackendKind) -> String {
    let target = match kind {
        BackendKind::Quantum => "Quantum",
        BackendKind::Lsf | BackendKind::Slurm => "HPC",
    };
    format!("Failed to submit a job to {target}")
}

/// Build the adapter for the configured backend
pub fn create_backend(
    settings: &WatcherSettings,
    credentials: Credentials,
) -> Result<Box<dyn BackendAdapter>, BackendError> {
    Ok(match settings.backend {
        BackendKind::Lsf => Box::new(LsfAdapter::new(settings, credentials)?),
        BackendKind::Slurm => Box::new(SlurmAdapter::new(settings, credentials)?),
        BackendKind::Quantum => Box::new(QuantumAdapter::new(settings, credentials)?),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::JobPayload;
    use std::collections::BTreeMap;
    use std::time::Duration;

    pub(crate) fn settings(backend: BackendKind, resource_url: &str) -> WatcherSettings {
        WatcherSettings {
            job_name: "sim".to_string(),
            namespace: "research".to_string(),
            resource_url: resource_url.to_string(),
            backend,
            poll_interval: Duration::from_secs(1),
            properties: BTreeMap::new(),
            payload: JobPayload::default(),
            storage: None,
            upload: None,
            staging_dir: std::env::temp_dir(),
            http_timeout: Duration::from_secs(5),
        }
    }

    pub(crate) fn credentials() -> Credentials {
        Credentials {
            username: "alice".to_string(),
            password: "s3cret".to_string(),
        }
    }

    #[test]
    fn factory_dispatches_on_backend_tag() {
        for kind in BackendKind::ALL {
            let adapter =
                create_backend(&settings(kind, "http://127.0.0.1:1/"), credentials()).unwrap();
            assert_eq!(adapter.kind(), kind);
        }
    }

    #[test]
    fn submit_failure_names_target() {
        assert_eq!(
            submit_failure_message(BackendKind::Quantum),
            "Failed to submit a job to Quantum"
        );
        assert_eq!(
            submit_failure_message(BackendKind::Slurm),
            "Failed to submit a job to HPC"
        );
    }
}
