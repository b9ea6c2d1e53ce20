//! IBM Spectrum LSF application center adapter
//!
//! Sessions are cookie tokens obtained from `ws/logon`. The token embeds its
//! issue time and is renewed once it is older than [`TOKEN_VALIDITY_HOURS`].
//! Submission uses the application center's multipart-of-multipart encoding.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use quick_xml::escape::partial_escape;
use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use bridge_common::time::{normalize_timestamp, parse_timestamp};
use bridge_common::{BackendKind, JobStatus};

use super::{
    lsf_history, BackendAdapter, HistoryEntry, JobSnapshot, ScriptPayload, SubmitRequest,
    Translation,
};
use crate::config::{Credentials, WatcherSettings};
use crate::error::BackendError;
use crate::http;

/// Age after which the session token is renewed
pub const TOKEN_VALIDITY_HOURS: i64 = 2;

const MULTIPLE_ACCEPT_TYPE: &str = "text/plain,application/xml,text/xml,multipart/mixed";
const QUOTE_MARKER: &str = "#quote#";
const SCRIPT_PART: &str = "script";
const STAGED_SCRIPT_COMMAND: &str =
    "chmod 755 `pwd`/script;sed -i -e 's/\\r$//' `pwd`/script;`pwd`/script";

/// Job property names translated into application parameters
const RESOURCES: [(&str, &str); 5] = [
    ("RunLimitHour", "RUNLIMITHOUR"),
    ("RunLimitMinute", "RUNLIMITMINUTE"),
    ("Queue", "QUEUE"),
    ("OutputFileName", "OUTPUT_FILE"),
    ("ErrorFileName", "ERROR_FILE"),
];

struct Session {
    cookie: String,
    issued: chrono::DateTime<Utc>,
}

impl Session {
    fn from_token(token: &str) -> Self {
        let token = token.replace('"', QUOTE_MARKER);
        let issued = token
            .split(QUOTE_MARKER)
            .nth(1)
            .and_then(|t| parse_timestamp(t).ok())
            .unwrap_or_else(|| {
                warn!("cannot read issue time from LSF token, treating it as expired");
                Utc::now() - ChronoDuration::hours(TOKEN_VALIDITY_HOURS + 1)
            });
        Self {
            cookie: format!("platform_token={token}"),
            issued,
        }
    }

    fn expired(&self) -> bool {
        Utc::now() - self.issued >= ChronoDuration::hours(TOKEN_VALIDITY_HOURS)
    }
}

/// A file carried in the files area of a submission
struct StagedFile<'a> {
    name: &'a str,
    content: &'a str,
}

/// Talks to the LSF application center web services
pub struct LsfAdapter {
    http: Client,
    base_url: String,
    credentials: Credentials,
    properties: BTreeMap<String, String>,
    upload_files: Vec<String>,
    session: RwLock<Option<Session>>,
}

#[derive(Deserialize)]
struct LogonResponse {
    #[serde(default)]
    token: String,
}

#[derive(Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    id: u64,
}

#[derive(Deserialize)]
struct JobInfo {
    #[serde(default)]
    job: BTreeMap<String, Value>,
}

fn field(job: &BTreeMap<String, Value>, key: &str) -> Option<String> {
    match job.get(key)? {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn name_area(boundary: &str, app_name: &str) -> String {
    format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"AppName\"\r\nContent-ID: <AppName>\r\n\r\n{app_name}\r\n"
    )
}

fn app_param(out: &mut String, boundary: &str, id: &str, value: &str, kind: &str) {
    let _ = write!(
        out,
        "--{boundary}\r\nContent-Disposition: form-data; name=\"{id}\"\r\nContent-Type: application/xml; charset=UTF-8\r\nContent-Transfer-Encoding: 8bit\r\nAccept-Language: en\r\n\r\n<AppParam><id>{id}</id><value>{}</value><type>{kind}</type></AppParam>\r\n",
        partial_escape(value)
    );
}

fn params_area(
    boundary: &str,
    inner: &str,
    params: &BTreeMap<String, String>,
    files: &[StagedFile<'_>],
) -> String {
    let mut out = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"data\"\r\nContent-ID: <data>\r\nAccept-Language: en-us\r\nContent-Type: multipart/mixed; boundary={inner}\r\n\r\n"
    );
    for (id, value) in params {
        app_param(&mut out, inner, id, value, "");
    }
    for file in files {
        app_param(&mut out, inner, file.name, &format!("{},upload", file.name), "file");
    }
    let _ = write!(out, "--{inner}--\r\n");
    out
}

fn files_area(boundary: &str, files: &[StagedFile<'_>]) -> String {
    let mut out = String::new();
    for file in files {
        let _ = write!(
            out,
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\nContent-Type: application/octet-stream\r\nContent-ID: <{name}>\r\nContent-Transfer-Encoding: 8bit\r\n\r\n{content}\r\n",
            name = file.name,
            content = file.content
        );
    }
    out
}

/// Submission body: name area, nested params area, files area
fn submit_body(
    boundary: &str,
    inner: &str,
    params: &BTreeMap<String, String>,
    files: &[StagedFile<'_>],
) -> String {
    format!(
        "{}{}{}--{boundary}--",
        name_area(boundary, "generic"),
        params_area(boundary, inner, params, files),
        files_area(boundary, files)
    )
}

fn upload_body(boundary: &str, dir: &str, file: &StagedFile<'_>) -> String {
    format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"dir\"\r\n\r\n{dir}\r\n--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\nContent-Type: application/octet-stream\r\nContent-ID: <{name}>\r\n\r\n{content}\r\n--{boundary}--",
        name = file.name,
        content = file.content
    )
}

/// Strip the transfer wrapper from a downloaded file
fn extract_download(body: &str, name: &str) -> String {
    let short = name.rsplit('/').next().unwrap_or(name);
    match body.split_once(&format!("{short}>")) {
        Some((_, content)) => content.to_string(),
        None => body.to_string(),
    }
}

impl LsfAdapter {
    pub fn new(settings: &WatcherSettings, credentials: Credentials) -> Result<Self, BackendError> {
        Ok(Self {
            http: http::client(settings.http_timeout)?,
            base_url: settings.resource_url.clone(),
            credentials,
            properties: settings.properties.clone(),
            upload_files: settings
                .upload
                .as_ref()
                .map(|u| u.files.clone())
                .unwrap_or_default(),
            session: RwLock::new(None),
        })
    }

    fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, BackendError> {
        let session = self.session.read().await;
        let cookie = session
            .as_ref()
            .map(|s| s.cookie.clone())
            .ok_or_else(|| BackendError::Auth("no LSF session".to_string()))?;
        Ok(self
            .http
            .request(method, http::endpoint(&self.base_url, path))
            .header("Cookie", cookie))
    }

    async fn logon(&self) -> Result<Session, BackendError> {
        let body = format!(
            "<User><name>{}</name> <pass>{}</pass> </User>",
            partial_escape(&self.credentials.username),
            partial_escape(&self.credentials.password)
        );
        let response: LogonResponse = http::send_json(
            "logon",
            self.http
                .post(http::endpoint(&self.base_url, "ws/logon"))
                .header("Accept", "application/json")
                .header("Content-Type", "application/xml")
                .body(body),
        )
        .await
        .map_err(|e| BackendError::Auth(e.to_string()))?;

        if response.token.is_empty() {
            return Err(BackendError::Auth("logon returned no token".to_string()));
        }
        Ok(Session::from_token(&response.token))
    }

    fn job_params(&self, request: &SubmitRequest) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("JOB_NAME".to_string(), request.job_name.clone());
        let command = match &request.script {
            ScriptPayload::Remote(path) => path.clone(),
            ScriptPayload::Content(_) => STAGED_SCRIPT_COMMAND.to_string(),
        };
        params.insert("COMMANDTORUN".to_string(), command);

        for (property, value) in &self.properties {
            if property == "numnodes" {
                params.insert("EXTRA_PARAMS".to_string(), format!("-nnodes {value}"));
            } else if let Some((_, param)) = RESOURCES.iter().find(|(p, _)| *p == property.as_str()) {
                params.insert(param.to_string(), value.clone());
            }
        }
        params
    }
}

#[async_trait]
impl BackendAdapter for LsfAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Lsf
    }

    async fn authenticate(&self) -> Result<(), BackendError> {
        let current = self.session.read().await;
        if current.as_ref().is_some_and(|s| !s.expired()) {
            return Ok(());
        }
        drop(current);

        let session = self.logon().await?;
        debug!(issued = %session.issued, "LSF session established");
        *self.session.write().await = Some(session);
        Ok(())
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<String, BackendError> {
        let files: Vec<StagedFile<'_>> = match &request.script {
            ScriptPayload::Content(content) => vec![StagedFile {
                name: SCRIPT_PART,
                content,
            }],
            ScriptPayload::Remote(_) => Vec::new(),
        };

        let boundary = Uuid::new_v4().to_string();
        let inner = Uuid::new_v4().to_string();
        let body = submit_body(&boundary, &inner, &self.job_params(request), &files);

        let response: SubmitResponse = http::send_json(
            "submit",
            self.request(Method::POST, "ws/jobs/submit")
                .await?
                .header("Accept", "application/json")
                .header("Content-Type", format!("multipart/mixed; boundary={boundary}"))
                .body(body),
        )
        .await?;

        if response.id == 0 {
            return Err(BackendError::Rejected("scheduler returned job id 0".to_string()));
        }
        info!(remote_id = response.id, "submitted LSF job");
        Ok(response.id.to_string())
    }

    async fn poll(&self, remote_id: &str) -> Result<JobSnapshot, BackendError> {
        let info: JobInfo = http::send_json(
            "poll",
            self.request(Method::GET, &format!("ws/jobs/{remote_id}"))
                .await?
                .header("Accept", "application/json"),
        )
        .await?;

        let native_state = field(&info.job, "jobStatus")
            .ok_or_else(|| BackendError::invalid("poll", "jobStatus missing"))?;
        Ok(JobSnapshot {
            native_state,
            submit_time: field(&info.job, "submitTime").map(|t| normalize_timestamp(&t)),
            start_time: field(&info.job, "startTime").map(|t| normalize_timestamp(&t)),
            end_time: field(&info.job, "endTime").map(|t| normalize_timestamp(&t)),
            working_dir: field(&info.job, "cwd"),
        })
    }

    async fn history(&self, remote_id: &str) -> Result<Option<HistoryEntry>, BackendError> {
        let body = http::send_text(
            "history",
            self.request(Method::GET, &format!("ws/jobhistory?ids={remote_id}"))
                .await?
                .header("Content-Type", "application/xml")
                .header("Accept", MULTIPLE_ACCEPT_TYPE),
        )
        .await?;
        lsf_history::parse(&body).map_err(|e| BackendError::invalid("history", e.to_string()))
    }

    async fn cancel(&self, remote_id: &str, native_state: &str) -> Result<(), BackendError> {
        if matches!(native_state, "KILL" | "DONE" | "EXIT" | "FAILED") {
            info!(remote_id, native_state, "job already finished, nothing to cancel");
            return Ok(());
        }
        http::send(
            "cancel",
            self.request(Method::POST, "ws/userCmd")
                .await?
                .header("Accept", "application/json")
                .header("Content-Type", "application/xml")
                .body(format!("<UserCmd><cmd>bkill {remote_id}</cmd></UserCmd>")),
        )
        .await?;
        info!(remote_id, "cancelled LSF job");
        Ok(())
    }

    fn translate(&self, native_state: &str) -> Translation {
        match native_state {
            "PEND" | "PSUSP" => JobStatus::Pending,
            "RUN" | "USUSP" | "SSUSP" | "PROV" | "WAIT" => JobStatus::Running,
            "DONE" => JobStatus::Done,
            "EXIT" | "FAILED" => JobStatus::Failed,
            "KILL" => JobStatus::Kill,
            _ => JobStatus::Unknown,
        }
        .into()
    }

    fn output_files(&self) -> Vec<String> {
        self.upload_files.clone()
    }

    async fn fetch_output(
        &self,
        remote_id: &str,
        name: &str,
    ) -> Result<Option<Vec<u8>>, BackendError> {
        let body = http::send_text(
            "download",
            self.request(Method::GET, &format!("webservice/pacclient/file/{remote_id}"))
                .await?
                .header("Accept", MULTIPLE_ACCEPT_TYPE)
                .header("Content-Type", "text/plain")
                .body(name.to_string()),
        )
        .await?;
        let content = extract_download(&body, name);
        Ok((!content.is_empty()).then(|| content.into_bytes()))
    }

    async fn stage_input(&self, path: &Path) -> Result<(), BackendError> {
        let dir = self.property("inputfiledirectory").ok_or_else(|| {
            BackendError::Rejected("no input file directory specified to upload to".to_string())
        })?;
        let past_id = self.property("pastid").ok_or_else(|| {
            BackendError::Rejected("job property pastid is required to upload inputs".to_string())
        })?;

        let display = path.display().to_string();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| BackendError::io(display.clone(), e))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| BackendError::invalid("upload", format!("no file name in {display}")))?;

        let boundary = Uuid::new_v4().to_string();
        http::send(
            "upload",
            self.request(Method::POST, &format!("ws/jobfiles/upload/{past_id}"))
                .await?
                .header("Accept", "application/xml")
                .header("Content-Type", format!("multipart/mixed; boundary={boundary}"))
                .body(upload_body(&boundary, dir, &StagedFile { name, content: &content })),
        )
        .await?;
        info!(file = name, dir, "uploaded input file to LSF");
        Ok(())
    }

    fn completion_message(&self, snapshot: &JobSnapshot, uploaded: bool) -> Option<String> {
        let cwd = snapshot.working_dir.as_deref()?;
        Some(if uploaded {
            format!(
                "Output, error and additional downloaded files can be found at S3 location specified or your home directory (path {cwd})"
            )
        } else {
            format!("Output and error files can be found in your home directory, path {cwd}")
        })
    }
}
