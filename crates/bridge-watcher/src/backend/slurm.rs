//! SLURM REST adapter
//!
//! Static user name and token headers, validated once with a ping. Jobs are
//! submitted as one JSON document with the script inlined.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use bridge_common::time::normalize_timestamp;
use bridge_common::{BackendKind, JobStatus};

use super::{BackendAdapter, JobSnapshot, ScriptPayload, SubmitRequest, Translation};
use crate::config::{Credentials, WatcherSettings};
use crate::error::BackendError;
use crate::http;

/// Talks to `slurmrestd`
pub struct SlurmAdapter {
    http: Client,
    base_url: String,
    credentials: Credentials,
    properties: BTreeMap<String, String>,
    verified: AtomicBool,
}

#[derive(Serialize)]
struct SubmitBody<'a> {
    job: JobDescription<'a>,
    script: &'a str,
}

#[derive(Serialize)]
struct JobDescription<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    partition: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tasks: Option<u32>,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    nodes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_working_directory: Option<&'a str>,
    environment: Environment<'a>,
}

#[derive(Serialize)]
struct Environment<'a> {
    #[serde(rename = "PATH", skip_serializing_if = "Option::is_none")]
    path: Option<&'a str>,
    #[serde(rename = "LD_LIBRARY_PATH", skip_serializing_if = "Option::is_none")]
    ld_library_path: Option<&'a str>,
}

#[derive(Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    job_id: u64,
}

#[derive(Deserialize)]
struct JobsResponse {
    #[serde(default)]
    jobs: Vec<JobRecord>,
}

#[derive(Deserialize)]
struct JobRecord {
    job_state: Value,
    #[serde(default)]
    submit_time: Value,
    #[serde(default)]
    start_time: Value,
    #[serde(default)]
    end_time: Value,
    #[serde(default)]
    current_working_directory: Option<String>,
}

/// `job_state` is a string in older API versions and a list of flags in newer ones
fn state_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.first().and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

/// Epoch seconds, either bare or wrapped as `{"set": true, "number": n}`; zero means unset
fn epoch_of(value: &Value) -> Option<String> {
    let secs = match value {
        Value::Number(n) => n.as_i64(),
        Value::Object(o) => o.get("number").and_then(Value::as_i64),
        _ => None,
    }?;
    (secs > 0).then(|| normalize_timestamp(&secs.to_string()))
}

impl SlurmAdapter {
    pub fn new(settings: &WatcherSettings, credentials: Credentials) -> Result<Self, BackendError> {
        Ok(Self {
            http: http::client(settings.http_timeout)?,
            base_url: settings.resource_url.clone(),
            credentials,
            properties: settings.properties.clone(),
            verified: AtomicBool::new(false),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, http::endpoint(&self.base_url, path))
            .header("Accept", "application/json")
            .header("X-SLURM-USER-NAME", &self.credentials.username)
            .header("X-SLURM-USER-TOKEN", &self.credentials.password)
    }

    fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    fn number(&self, name: &str) -> Option<u32> {
        self.property(name).and_then(|v| v.trim().parse().ok())
    }
}

#[async_trait]
impl BackendAdapter for SlurmAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Slurm
    }

    async fn authenticate(&self) -> Result<(), BackendError> {
        if self.verified.load(Ordering::Acquire) {
            return Ok(());
        }
        http::send("ping", self.request(Method::GET, "ping"))
            .await
            .map_err(|e| BackendError::Auth(format!("SLURM token rejected: {e}")))?;
        self.verified.store(true, Ordering::Release);
        debug!("SLURM credentials verified");
        Ok(())
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<String, BackendError> {
        // slurmrestd only accepts inline scripts; a remote location carries the script text itself
        let script = match &request.script {
            ScriptPayload::Content(text) | ScriptPayload::Remote(text) => text.as_str(),
        };

        let body = SubmitBody {
            job: JobDescription {
                partition: self.property("Queue"),
                tasks: self.number("Tasks"),
                name: self.property("slurmJobName").unwrap_or(&request.job_name),
                nodes: self.number("NodesNumber"),
                current_working_directory: self.property("currentWorkingDir"),
                environment: Environment {
                    path: self.property("envPath"),
                    ld_library_path: self.property("envLibPath"),
                },
            },
            script,
        };

        let response: SubmitResponse = http::send_json(
            "submit",
            self.request(Method::POST, "job/submit").json(&body),
        )
        .await?;

        if response.job_id == 0 {
            return Err(BackendError::Rejected("scheduler returned job id 0".to_string()));
        }
        info!(remote_id = response.job_id, "submitted SLURM job");
        Ok(response.job_id.to_string())
    }

    async fn poll(&self, remote_id: &str) -> Result<JobSnapshot, BackendError> {
        let response: JobsResponse =
            http::send_json("poll", self.request(Method::GET, &format!("job/{remote_id}")))
                .await?;
        let job = response
            .jobs
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::invalid("poll", format!("no job {remote_id} in response")))?;
        let native_state = state_of(&job.job_state)
            .ok_or_else(|| BackendError::invalid("poll", "job_state missing"))?;

        Ok(JobSnapshot {
            native_state,
            submit_time: epoch_of(&job.submit_time),
            start_time: epoch_of(&job.start_time),
            end_time: epoch_of(&job.end_time),
            working_dir: job.current_working_directory.filter(|d| !d.is_empty()),
        })
    }

    async fn cancel(&self, remote_id: &str, native_state: &str) -> Result<(), BackendError> {
        if matches!(native_state, "CANCELLED" | "COMPLETED" | "FAILED") {
            info!(remote_id, native_state, "job already finished, nothing to cancel");
            return Ok(());
        }
        http::send("cancel", self.request(Method::DELETE, &format!("job/{remote_id}"))).await?;
        info!(remote_id, "cancelled SLURM job");
        Ok(())
    }

    fn translate(&self, native_state: &str) -> Translation {
        match native_state {
            "PENDING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED" => JobStatus::Pending,
            "RUNNING" | "COMPLETING" | "CONFIGURING" | "SUSPENDED" | "RESIZING" | "STAGE_OUT" => {
                JobStatus::Running
            }
            "COMPLETED" => JobStatus::Done,
            "CANCELLED" => JobStatus::Kill,
            "FAILED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" | "BOOT_FAIL" | "DEADLINE"
            | "PREEMPTED" => JobStatus::Failed,
            _ => JobStatus::Unknown,
        }
        .into()
    }

    fn output_files(&self) -> Vec<String> {
        Vec::new()
    }

    async fn fetch_output(
        &self,
        _remote_id: &str,
        _name: &str,
    ) -> Result<Option<Vec<u8>>, BackendError> {
        Err(BackendError::Unsupported("output download"))
    }
}
