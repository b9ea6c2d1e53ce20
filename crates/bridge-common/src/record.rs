//! Coordination record: the only state shared by controller and watcher
//!
//! The record is a flat string map stored in a ConfigMap named
//! `<job>-bridge-cm`. The controller seeds it from the BridgeJob spec and later
//! sets `kill` or a failure message; the watcher writes the remote id, status,
//! timestamps and message. Writes are per-key merge patches without a
//! resourceVersion, so the last writer of a key wins.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{BridgeJobSpec, BridgeJobStatus, ExtraLocation, ScriptLocation};
use crate::status::{BackendKind, JobStatus};
use crate::{Error, Result};

/// Fixed key vocabulary of the record
pub mod keys {
    /// Base URL of the remote scheduler
    pub const RESOURCE_URL: &str = "resourceURL";
    /// Poll interval in seconds
    pub const UPDATE_INTERVAL: &str = "updateinterval";
    /// Poll interval as written by older controllers
    pub const LEGACY_UPDATE_INTERVAL: &str = "updateInterval";
    /// JSON object of scheduler-specific properties
    pub const JOB_PROPERTIES: &str = "jobproperties";
    /// `"true"` once cancellation was requested
    pub const KILL: &str = "kill";
    /// Script text, path, program name or `bucket:object`
    pub const JOB_SCRIPT: &str = "jobdata.jobScript";
    /// `remote`, `inline` or `s3`
    pub const SCRIPT_LOCATION: &str = "jobdata.scriptLocation";
    /// Program metadata
    pub const SCRIPT_METADATA: &str = "jobdata.scriptMetadata";
    /// Job parameters
    pub const JOB_PARAMETERS: &str = "jobdata.jobParameters";
    /// `inline` or `s3`
    pub const SCRIPT_EXTRA_LOCATION: &str = "jobdata.scriptExtraLocation";
    /// Comma-separated `bucket:object` inputs
    pub const ADDITIONAL_DATA: &str = "jobdata.additionalData";
    /// Storage credential secret name
    pub const S3_SECRET: &str = "s3.secret";
    /// Storage endpoint
    pub const S3_ENDPOINT: &str = "s3.endpoint";
    /// `"true"` / `"false"`
    pub const S3_SECURE: &str = "s3.secure";
    /// Output bucket
    pub const UPLOAD_BUCKET: &str = "s3upload.bucket";
    /// Comma-separated output files
    pub const UPLOAD_FILES: &str = "s3upload.files";
    /// Remote job id, empty until submitted
    pub const REMOTE_ID: &str = "id";
    /// Resolved backend variant
    pub const BACKEND: &str = "backend";
    /// Canonical status
    pub const STATUS: &str = "status.jobStatus";
    /// Status key used by older watchers
    pub const LEGACY_STATUS: &str = "jobStatus";
    /// Submission time
    pub const SUBMIT_TIME: &str = "status.submitTime";
    /// Remote start time
    pub const START_TIME: &str = "status.startTime";
    /// Start time key used by older watchers
    pub const LEGACY_START_TIME: &str = "startTime";
    /// Completion time
    pub const END_TIME: &str = "status.endTime";
    /// Completion time keys used by older watchers
    pub const LEGACY_END_TIMES: [&str; 2] = ["endTime", "completiontime"];
    /// Human readable message
    pub const MESSAGE: &str = "status.message";
    /// Message key used by older watchers and controllers
    pub const LEGACY_MESSAGE: &str = "message";
    /// `"true"` when the status was recovered from scheduler history
    pub const HISTORY: &str = "history";
}

// =============================================================================
// Typed views
// =============================================================================

/// Object storage connection described by the record
#[derive(Clone, Debug, PartialEq)]
pub struct StorageConfig {
    /// Credential secret name
    pub secret: String,
    /// Endpoint host or URL
    pub endpoint: String,
    /// Use TLS
    pub secure: bool,
}

/// Output upload destination described by the record
#[derive(Clone, Debug, PartialEq)]
pub struct UploadConfig {
    /// Destination bucket
    pub bucket: String,
    /// Remote files to upload
    pub files: Vec<String>,
}

/// Split a comma-separated record value into trimmed, non-empty items
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// =============================================================================
// CoordinationRecord
// =============================================================================

/// Snapshot of the coordination record
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CoordinationRecord {
    name: String,
    data: BTreeMap<String, String>,
}

impl CoordinationRecord {
    /// Wrap raw record data
    pub fn new(name: impl Into<String>, data: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// Read the record out of its ConfigMap
    pub fn from_config_map(cm: &ConfigMap) -> Self {
        Self {
            name: cm.metadata.name.clone().unwrap_or_default(),
            data: cm.data.clone().unwrap_or_default(),
        }
    }

    /// Seed data for a new record
    ///
    /// Carries over the resource's prior status so a record recreated after
    /// deletion does not lose timestamps.
    pub fn initial_data(
        spec: &BridgeJobSpec,
        status: Option<&BridgeJobStatus>,
        backend: Option<BackendKind>,
    ) -> BTreeMap<String, String> {
        let mut data = BTreeMap::new();
        let mut put = |key: &str, value: &str| {
            data.insert(key.to_string(), value.to_string());
        };

        put(keys::UPDATE_INTERVAL, &spec.update_interval.to_string());
        put(keys::RESOURCE_URL, &spec.resource_url);
        put(keys::JOB_PROPERTIES, &spec.job_properties);

        let job_data = &spec.job_data;
        put(keys::JOB_SCRIPT, &job_data.job_script);
        put(keys::SCRIPT_LOCATION, job_data.script_location.as_str());
        put(keys::SCRIPT_METADATA, &job_data.script_metadata);
        put(keys::JOB_PARAMETERS, &job_data.job_parameters);
        put(keys::SCRIPT_EXTRA_LOCATION, job_data.script_extra_location.as_str());
        put(keys::ADDITIONAL_DATA, &job_data.additional_data);

        if let Some(storage) = spec.s3_storage.as_ref().filter(|s| !s.s3_secret.is_empty()) {
            put(keys::S3_SECRET, &storage.s3_secret);
            put(keys::S3_ENDPOINT, &storage.endpoint);
            put(keys::S3_SECURE, &storage.secure.to_string());
        }

        if let Some(upload) = spec.s3_upload.as_ref().filter(|u| !u.bucket.is_empty()) {
            put(keys::UPLOAD_BUCKET, &upload.bucket);
            put(keys::UPLOAD_FILES, &upload.files);
        }

        if let Some(kind) = backend {
            put(keys::BACKEND, kind.as_str());
        }

        if let Some(prior) = status.filter(|s| s.job_status.is_some()) {
            put(keys::SUBMIT_TIME, prior.start_time.as_deref().unwrap_or_default());
            put(keys::END_TIME, prior.completion_time.as_deref().unwrap_or_default());
            put(keys::MESSAGE, prior.message.as_deref().unwrap_or_default());
        }

        data
    }

    /// Record (ConfigMap) name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw data
    pub fn data(&self) -> &BTreeMap<String, String> {
        &self.data
    }

    /// Non-empty value of a key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    fn first_of(&self, candidates: &[&str]) -> Option<&str> {
        candidates.iter().find_map(|key| self.get(key))
    }

    /// Remote scheduler base URL
    pub fn resource_url(&self) -> Option<&str> {
        self.get(keys::RESOURCE_URL)
    }

    /// Poll interval in seconds
    pub fn update_interval(&self) -> Option<u64> {
        self.first_of(&[keys::UPDATE_INTERVAL, keys::LEGACY_UPDATE_INTERVAL])
            .and_then(|v| v.trim().parse().ok())
    }

    /// Scheduler-specific properties
    ///
    /// Non-string JSON values are stringified. Malformed JSON yields an empty
    /// map; the remote scheduler then applies its own defaults.
    pub fn job_properties(&self) -> BTreeMap<String, String> {
        let Some(raw) = self.get(keys::JOB_PROPERTIES) else {
            return BTreeMap::new();
        };
        match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(raw) {
            Ok(map) => map
                .into_iter()
                .map(|(k, v)| {
                    let value = match v {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (k, value)
                })
                .collect(),
            Err(e) => {
                warn!(record = %self.name, error = %e, "ignoring malformed job properties");
                BTreeMap::new()
            }
        }
    }

    /// Whether cancellation was requested
    pub fn kill_requested(&self) -> bool {
        self.get(keys::KILL)
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    /// Remote job id, once submitted
    pub fn remote_id(&self) -> Option<&str> {
        self.get(keys::REMOTE_ID)
    }

    /// Backend variant resolved by the controller
    pub fn backend(&self) -> Option<BackendKind> {
        self.get(keys::BACKEND).and_then(|v| v.parse().ok())
    }

    /// Canonical status written by the watcher
    pub fn job_status(&self) -> Option<JobStatus> {
        self.first_of(&[keys::STATUS, keys::LEGACY_STATUS])
            .map(JobStatus::parse_lenient)
    }

    /// Submission time, falling back to the remote start time
    pub fn submit_time(&self) -> Option<&str> {
        self.first_of(&[keys::SUBMIT_TIME, keys::START_TIME, keys::LEGACY_START_TIME])
    }

    /// Completion time
    pub fn end_time(&self) -> Option<&str> {
        self.get(keys::END_TIME)
            .or_else(|| self.first_of(&keys::LEGACY_END_TIMES))
    }

    /// Human readable message
    pub fn message(&self) -> Option<&str> {
        self.first_of(&[keys::MESSAGE, keys::LEGACY_MESSAGE])
    }

    /// Job script value
    pub fn job_script(&self) -> &str {
        self.get(keys::JOB_SCRIPT).unwrap_or_default()
    }

    /// Interpretation of the job script
    pub fn script_location(&self) -> ScriptLocation {
        ScriptLocation::from_record(self.get(keys::SCRIPT_LOCATION).unwrap_or_default())
    }

    /// Program metadata value
    pub fn script_metadata(&self) -> Option<&str> {
        self.get(keys::SCRIPT_METADATA)
    }

    /// Job parameters value
    pub fn job_parameters(&self) -> Option<&str> {
        self.get(keys::JOB_PARAMETERS)
    }

    /// Interpretation of metadata and parameters
    pub fn extra_location(&self) -> ExtraLocation {
        ExtraLocation::from_record(self.get(keys::SCRIPT_EXTRA_LOCATION).unwrap_or_default())
    }

    /// `bucket:object` inputs to stage
    pub fn additional_data(&self) -> Vec<String> {
        split_list(self.get(keys::ADDITIONAL_DATA).unwrap_or_default())
    }

    /// Object storage connection, when a credential secret is configured
    pub fn storage(&self) -> Option<StorageConfig> {
        let secret = self.get(keys::S3_SECRET)?;
        Some(StorageConfig {
            secret: secret.to_string(),
            endpoint: self.get(keys::S3_ENDPOINT).unwrap_or_default().to_string(),
            secure: self
                .get(keys::S3_SECURE)
                .map(|v| v.trim().eq_ignore_ascii_case("true"))
                .unwrap_or(true),
        })
    }

    /// Output upload destination, when a bucket is configured
    pub fn upload(&self) -> Option<UploadConfig> {
        let bucket = self.get(keys::UPLOAD_BUCKET)?;
        Some(UploadConfig {
            bucket: bucket.to_string(),
            files: split_list(self.get(keys::UPLOAD_FILES).unwrap_or_default()),
        })
    }

    /// The subset of `update` that differs from this snapshot
    pub fn changes(&self, update: &RecordUpdate) -> RecordUpdate {
        let entries = update
            .entries
            .iter()
            .filter(|(k, v)| self.data.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        RecordUpdate { entries }
    }

    /// Apply an update to this snapshot in place
    pub fn apply(&mut self, update: &RecordUpdate) {
        for (k, v) in &update.entries {
            self.data.insert(k.clone(), v.clone());
        }
    }
}

// =============================================================================
// RecordUpdate
// =============================================================================

/// A set of key writes destined for the record
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecordUpdate {
    entries: BTreeMap<String, String>,
}

impl RecordUpdate {
    /// Empty update
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an arbitrary key
    pub fn set(mut self, key: &str, value: impl Into<String>) -> Self {
        self.entries.insert(key.to_string(), value.into());
        self
    }

    /// Set an arbitrary key in place
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.entries.insert(key.to_string(), value.into());
    }

    /// Canonical status
    pub fn status(self, status: JobStatus) -> Self {
        self.set(keys::STATUS, status.as_str())
    }

    /// Human readable message
    pub fn message(self, message: impl Into<String>) -> Self {
        self.set(keys::MESSAGE, message)
    }

    /// Remote job id
    pub fn remote_id(self, id: impl Into<String>) -> Self {
        self.set(keys::REMOTE_ID, id)
    }

    /// Whether there is nothing to write
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Value staged for a key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// All staged writes
    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }
}

// =============================================================================
// RecordStore
// =============================================================================

/// Access to one job's coordination record
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Read the current record
    async fn load(&self) -> Result<CoordinationRecord>;

    /// Merge the given keys into the record; an empty update is a no-op
    async fn write(&self, update: &RecordUpdate) -> Result<()>;
}

/// RecordStore backed by the job's ConfigMap
pub struct ConfigMapRecordStore {
    api: Api<ConfigMap>,
    name: String,
    field_manager: &'static str,
}

impl ConfigMapRecordStore {
    /// Store for the record of `job_name` in `namespace`
    pub fn new(client: Client, namespace: &str, job_name: &str, field_manager: &'static str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: crate::record_name(job_name),
            field_manager,
        }
    }
}

/// Merge patch body writing `update` into a ConfigMap's data
pub fn merge_patch(update: &RecordUpdate) -> serde_json::Value {
    serde_json::json!({ "data": update.entries() })
}

#[async_trait]
impl RecordStore for ConfigMapRecordStore {
    async fn load(&self) -> Result<CoordinationRecord> {
        match self.api.get(&self.name).await {
            Ok(cm) => Ok(CoordinationRecord::from_config_map(&cm)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                Err(Error::record(&self.name, "not found"))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, update: &RecordUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        for (key, value) in update.entries() {
            debug!(record = %self.name, key = %key, value = %value, "record change");
        }
        self.api
            .patch(
                &self.name,
                &PatchParams::apply(self.field_manager),
                &Patch::Merge(&merge_patch(update)),
            )
            .await?;
        Ok(())
    }
}
