//! Quantum runtime adapter
//!
//! Requests carry the service CRN and API key as headers. Submission is two
//! phase: the program is looked up by name or uploaded, then a job run is
//! created against it.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::{Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use bridge_common::time::normalize_timestamp;
use bridge_common::{BackendKind, JobStatus};

use super::{BackendAdapter, JobSnapshot, ScriptPayload, SubmitRequest, Translation};
use crate::config::{Credentials, WatcherSettings};
use crate::error::BackendError;
use crate::http;

/// Native state the runtime reports when it aborts a job for running too long
pub const RAN_TOO_LONG: &str = "Cancelled - Ran too long";
const RAN_TOO_LONG_MESSAGE: &str = "Job execution takes too long, aborted by runtime";

/// Artifact name and the job sub-resource it is read from
const OUTPUTS: [(&str, &str); 3] = [
    ("results", "results"),
    ("intermediateresults", "interim_results"),
    ("logs", "logs"),
];

/// Talks to the quantum runtime REST API
pub struct QuantumAdapter {
    http: Client,
    base_url: String,
    credentials: Credentials,
}

#[derive(Debug, Default, Deserialize)]
struct ProgramMetadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    cost: i64,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    spec: Value,
    #[serde(default)]
    is_public: bool,
}

#[derive(Serialize)]
struct ProgramRequest<'a> {
    name: &'a str,
    data: String,
    cost: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    spec: &'a Value,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    is_public: bool,
}

#[derive(Debug, Default, Deserialize)]
struct JobParameters {
    #[serde(default)]
    params: Option<Map<String, Value>>,
}

#[derive(Serialize)]
struct JobRunRequest<'a> {
    program_id: &'a str,
    backend: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
struct Created {
    #[serde(default)]
    id: String,
}

#[derive(Deserialize)]
struct ProgramList {
    #[serde(default)]
    programs: Vec<Created>,
}

#[derive(Deserialize)]
struct JobState {
    #[serde(default)]
    status: String,
    #[serde(default)]
    created: Option<String>,
}

impl QuantumAdapter {
    pub fn new(settings: &WatcherSettings, credentials: Credentials) -> Result<Self, BackendError> {
        Ok(Self {
            http: http::client(settings.http_timeout)?,
            base_url: settings.resource_url.clone(),
            credentials,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, http::endpoint(&self.base_url, path))
            .header("Content-Type", "application/json")
            .header("Service-CRN", &self.credentials.username)
            .header("Authorization", format!("apikey {}", self.credentials.password))
    }

    async fn find_program(&self, name: &str) -> Result<String, BackendError> {
        let list: ProgramList = http::send_json(
            "program lookup",
            self.request(Method::GET, "programs").query(&[("name", name)]),
        )
        .await?;
        match list.programs.as_slice() {
            [program] if !program.id.is_empty() => Ok(program.id.clone()),
            programs => Err(BackendError::Rejected(format!(
                "expected exactly one program named {name}, found {}",
                programs.len()
            ))),
        }
    }

    async fn create_program(&self, data: &str, metadata: Option<&str>) -> Result<String, BackendError> {
        if data.is_empty() {
            return Err(BackendError::Rejected("program data is empty".to_string()));
        }
        let metadata: ProgramMetadata = match metadata {
            Some(text) => serde_json::from_str(text)
                .map_err(|e| BackendError::Rejected(format!("invalid program metadata: {e}")))?,
            None => ProgramMetadata::default(),
        };

        let created: Created = http::send_json(
            "program upload",
            self.request(Method::POST, "programs").json(&ProgramRequest {
                name: &metadata.name,
                data: STANDARD.encode(data),
                cost: metadata.cost,
                description: metadata.description.as_deref(),
                spec: &metadata.spec,
                is_public: metadata.is_public,
            }),
        )
        .await?;
        if created.id.is_empty() {
            return Err(BackendError::invalid("program upload", "no program id returned"));
        }
        info!(program_id = %created.id, "uploaded quantum program");
        Ok(created.id)
    }
}

#[async_trait]
impl BackendAdapter for QuantumAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Quantum
    }

    async fn authenticate(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<String, BackendError> {
        let program_id = match &request.script {
            ScriptPayload::Remote(name) => self.find_program(name).await?,
            ScriptPayload::Content(data) => {
                self.create_program(data, request.metadata.as_deref()).await?
            }
        };

        let parameters: JobParameters = match request.parameters.as_deref() {
            Some(text) => serde_json::from_str(text)
                .map_err(|e| BackendError::Rejected(format!("invalid job parameters: {e}")))?,
            None => JobParameters::default(),
        };

        let created: Created = http::send_json(
            "submit",
            self.request(Method::POST, "jobs").json(&JobRunRequest {
                program_id: &program_id,
                backend: "",
                params: parameters.params,
            }),
        )
        .await?;
        if created.id.is_empty() {
            return Err(BackendError::Rejected("runtime returned no job id".to_string()));
        }
        info!(remote_id = %created.id, program_id = %program_id, "submitted quantum job");
        Ok(created.id)
    }

    async fn poll(&self, remote_id: &str) -> Result<JobSnapshot, BackendError> {
        let state: JobState =
            http::send_json("poll", self.request(Method::GET, &format!("jobs/{remote_id}"))).await?;
        if state.status.is_empty() {
            return Err(BackendError::invalid("poll", "status missing"));
        }
        Ok(JobSnapshot {
            native_state: state.status,
            submit_time: state
                .created
                .filter(|c| !c.is_empty())
                .map(|c| normalize_timestamp(&c)),
            ..Default::default()
        })
    }

    async fn cancel(&self, remote_id: &str, native_state: &str) -> Result<(), BackendError> {
        if !matches!(native_state, "Queued" | "Running") {
            info!(remote_id, native_state, "job not queued or running, nothing to cancel");
            return Ok(());
        }
        http::send(
            "cancel",
            self.request(Method::POST, &format!("jobs/{remote_id}/cancel")),
        )
        .await?;
        info!(remote_id, "cancelled quantum job");
        Ok(())
    }

    fn translate(&self, native_state: &str) -> Translation {
        match native_state {
            "Queued" | "Initializing" => JobStatus::Pending.into(),
            "Running" => JobStatus::Running.into(),
            "Completed" => JobStatus::Succeeded.into(),
            "Cancelled" => JobStatus::Kill.into(),
            RAN_TOO_LONG => Translation {
                status: JobStatus::Failed,
                message: Some(RAN_TOO_LONG_MESSAGE.to_string()),
            },
            "Failed" => JobStatus::Failed.into(),
            _ => JobStatus::Unknown.into(),
        }
    }

    fn output_files(&self) -> Vec<String> {
        OUTPUTS.iter().map(|(name, _)| name.to_string()).collect()
    }

    async fn fetch_output(
        &self,
        remote_id: &str,
        name: &str,
    ) -> Result<Option<Vec<u8>>, BackendError> {
        let (_, resource) = OUTPUTS
            .iter()
            .find(|(artifact, _)| *artifact == name)
            .ok_or_else(|| BackendError::invalid("download", format!("unknown output {name}")))?;
        let body = http::send(
            "download",
            self.request(Method::GET, &format!("jobs/{remote_id}/{resource}")),
        )
        .await?;
        Ok((!body.is_empty()).then_some(body))
    }
}
