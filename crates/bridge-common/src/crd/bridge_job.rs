//! BridgeJob CRD types
//!
//! A `BridgeJob` describes one job to run on an off-cluster scheduler. The
//! controller turns it into a coordination record plus a watcher pod; the
//! watcher drives the remote job and reports back through the record.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::status::{BackendKind, JobStatus};

// =============================================================================
// Payload locations
// =============================================================================

/// Where the job script lives
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLocation {
    /// Path (or program name) already present on the remote system
    #[default]
    Remote,
    /// Script text embedded in the resource
    Inline,
    /// `bucket:object` reference into object storage
    #[serde(alias = "object-store")]
    S3,
}

impl ScriptLocation {
    /// Value stored in the coordination record
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Inline => "inline",
            Self::S3 => "s3",
        }
    }

    /// Parse a record value; unrecognized values fall back to the default
    pub fn from_record(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "inline" => Self::Inline,
            "s3" | "object-store" => Self::S3,
            _ => Self::Remote,
        }
    }
}

/// Where script metadata and job parameters live
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExtraLocation {
    /// Embedded in the resource
    #[default]
    Inline,
    /// `bucket:object` reference into object storage
    #[serde(alias = "object-store")]
    S3,
}

impl ExtraLocation {
    /// Value stored in the coordination record
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::S3 => "s3",
        }
    }

    /// Parse a record value; unrecognized values fall back to the default
    pub fn from_record(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "s3" | "object-store" => Self::S3,
            _ => Self::Inline,
        }
    }
}

// =============================================================================
// Spec sections
// =============================================================================

/// Script, metadata and parameter payloads of a job
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobData {
    /// Script text, remote path, program name or `bucket:object`
    #[serde(default)]
    pub job_script: String,

    /// Interpretation of `job_script`
    #[serde(default)]
    pub script_location: ScriptLocation,

    /// Program metadata (quantum backend)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub script_metadata: String,

    /// Job parameters document (quantum backend)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub job_parameters: String,

    /// Interpretation of `script_metadata` and `job_parameters`
    #[serde(default)]
    pub script_extra_location: ExtraLocation,

    /// Comma-separated `bucket:object` inputs to stage before submission
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub additional_data: String,
}

/// Object storage connection for staging
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct S3Storage {
    /// Secret holding `accesskey` and `secretkey`
    #[serde(default)]
    pub s3_secret: String,

    /// Endpoint host (and optional port) of the S3-compatible service
    #[serde(default)]
    pub endpoint: String,

    /// Use TLS when talking to the endpoint
    #[serde(default = "default_true")]
    pub secure: bool,
}

/// Outputs to upload once the remote job finishes
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct S3Upload {
    /// Destination bucket, created when absent
    #[serde(default)]
    pub bucket: String,

    /// Comma-separated list of remote files to upload
    #[serde(default)]
    pub files: String,
}

fn default_true() -> bool {
    true
}

fn default_update_interval() -> u32 {
    20
}

fn default_pull_policy() -> String {
    "IfNotPresent".to_string()
}

// =============================================================================
// CRD
// =============================================================================

/// A job executed on an external scheduler and mirrored into the cluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "bridge.dev",
    version = "v1alpha1",
    kind = "BridgeJob",
    plural = "bridgejobs",
    shortname = "bj",
    namespaced,
    status = "BridgeJobStatus",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.jobstatus"}"#,
    printcolumn = r#"{"name":"Started","type":"string","jsonPath":".status.starttime"}"#,
    printcolumn = r#"{"name":"Completed","type":"string","jsonPath":".status.completiontime"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BridgeJobSpec {
    /// Watcher image
    pub image: String,

    /// Pull policy for the watcher image
    #[serde(default = "default_pull_policy")]
    pub image_pull_policy: String,

    /// Base URL of the remote scheduler API
    #[serde(rename = "resourceURL")]
    pub resource_url: String,

    /// Secret holding `username` and `password` for the remote scheduler
    pub resource_secret: String,

    /// Seconds between watcher poll cycles
    #[serde(default = "default_update_interval")]
    pub update_interval: u32,

    /// Request cancellation of the remote job
    #[serde(default)]
    pub kill: bool,

    /// Script and parameter payloads
    #[serde(default)]
    pub job_data: JobData,

    /// JSON object of scheduler-specific job properties
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub job_properties: String,

    /// Object storage connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_storage: Option<S3Storage>,

    /// Output upload destination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_upload: Option<S3Upload>,

    /// Remote scheduler family; derived from `image` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
}

impl BridgeJobSpec {
    /// Declared backend, falling back to image-name detection
    pub fn resolved_backend(&self) -> Option<BackendKind> {
        self.backend.or_else(|| BackendKind::from_image(&self.image))
    }

    /// Name of the storage credential secret, if configured
    pub fn storage_secret(&self) -> Option<&str> {
        self.s3_storage
            .as_ref()
            .map(|s| s.s3_secret.as_str())
            .filter(|s| !s.is_empty())
    }

    /// Destination bucket for outputs, if configured
    pub fn upload_bucket(&self) -> Option<&str> {
        self.s3_upload
            .as_ref()
            .map(|u| u.bucket.as_str())
            .filter(|b| !b.is_empty())
    }

    /// Whether any field requires object storage access
    pub fn storage_implied(&self) -> bool {
        self.job_data.script_location == ScriptLocation::S3
            || self.job_data.script_extra_location == ExtraLocation::S3
            || !self.job_data.additional_data.is_empty()
            || self.upload_bucket().is_some()
    }
}

/// Status projected from the coordination record
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct BridgeJobStatus {
    /// Canonical job status
    #[serde(default, rename = "jobstatus", skip_serializing_if = "Option::is_none")]
    pub job_status: Option<JobStatus>,

    /// Submission time of the remote job
    #[serde(default, rename = "starttime", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,

    /// Completion time of the remote job
    #[serde(
        default,
        rename = "completiontime",
        skip_serializing_if = "Option::is_none"
    )]
    pub completion_time: Option<String>,

    /// Human readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl BridgeJob {
    /// Last status recorded on the resource
    pub fn job_status(&self) -> Option<JobStatus> {
        self.status.as_ref().and_then(|s| s.job_status)
    }
}
