//! Watcher configuration
//!
//! Command-line and environment inputs are parsed once with clap, then merged
//! with the coordination record into an immutable [`WatcherSettings`] that is
//! threaded through the engine, the adapters and the stager.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;

use bridge_common::crd::{ExtraLocation, ScriptLocation};
use bridge_common::record::{CoordinationRecord, StorageConfig, UploadConfig};
use bridge_common::BackendKind;

use crate::error::{Result, WatcherError};

/// Poll interval used when the record carries none
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 20;

/// Per-job watcher process
#[derive(Parser, Debug, Clone)]
#[command(name = "bridge-watcher", version, about = "Drives one BridgeJob on its remote scheduler")]
pub struct WatcherArgs {
    /// BridgeJob name
    #[arg(long, env = "JOBNAME")]
    pub job_name: String,

    /// Namespace of the BridgeJob and its record
    #[arg(long, env = "NAMESPACE")]
    pub namespace: String,

    /// Backend to use when the record does not name one
    #[arg(long, env = "BRIDGE_BACKEND")]
    pub backend: Option<BackendKind>,

    /// Directory holding the mounted `username` and `password` files
    #[arg(long, env = "BRIDGE_CREDENTIALS_DIR", default_value = "/credentials")]
    pub credentials_dir: PathBuf,

    /// Directory holding the mounted `accesskey` and `secretkey` files
    #[arg(long, env = "BRIDGE_S3_CREDENTIALS_DIR", default_value = "/s3credentials")]
    pub storage_credentials_dir: PathBuf,

    /// Scratch directory for scripts and staged files
    #[arg(long, env = "BRIDGE_STAGING_DIR", default_value = "/downloads")]
    pub staging_dir: PathBuf,

    /// Timeout for every remote HTTP request, in seconds
    #[arg(long, env = "BRIDGE_HTTP_TIMEOUT_SECS", default_value_t = 10)]
    pub http_timeout_secs: u64,
}

/// Script, metadata and parameter payloads as described by the record
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobPayload {
    /// Script text, remote path, program name or `bucket:object`
    pub script: String,
    /// Interpretation of `script`
    pub script_location: ScriptLocation,
    /// Program metadata (inline text or `bucket:object`)
    pub metadata: Option<String>,
    /// Job parameters (inline text or `bucket:object`)
    pub parameters: Option<String>,
    /// Interpretation of metadata and parameters
    pub extra_location: ExtraLocation,
    /// `bucket:object` inputs to stage before submission
    pub additional_data: Vec<String>,
}

/// Everything the watcher needs to know, fixed at startup
#[derive(Clone, Debug)]
pub struct WatcherSettings {
    pub job_name: String,
    pub namespace: String,
    pub resource_url: String,
    pub backend: BackendKind,
    pub poll_interval: Duration,
    pub properties: BTreeMap<String, String>,
    pub payload: JobPayload,
    pub storage: Option<StorageConfig>,
    pub upload: Option<UploadConfig>,
    pub staging_dir: PathBuf,
    pub http_timeout: Duration,
}

impl WatcherSettings {
    /// Combine process arguments with the coordination record
    pub fn from_record(args: &WatcherArgs, record: &CoordinationRecord) -> Result<Self> {
        let resource_url = record
            .resource_url()
            .ok_or_else(|| WatcherError::config("record has no resourceURL"))?
            .to_string();

        let backend = record
            .backend()
            .or(args.backend)
            .ok_or_else(|| WatcherError::config("record names no backend and none was given"))?;

        let poll_interval = record
            .update_interval()
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS)
            .max(1);

        Ok(Self {
            job_name: args.job_name.clone(),
            namespace: args.namespace.clone(),
            resource_url,
            backend,
            poll_interval: Duration::from_secs(poll_interval),
            properties: record.job_properties(),
            payload: JobPayload {
                script: record.job_script().to_string(),
                script_location: record.script_location(),
                metadata: record.script_metadata().map(str::to_string),
                parameters: record.job_parameters().map(str::to_string),
                extra_location: record.extra_location(),
                additional_data: record.additional_data(),
            },
            storage: record.storage(),
            upload: record.upload(),
            staging_dir: args.staging_dir.clone(),
            http_timeout: Duration::from_secs(args.http_timeout_secs.max(1)),
        })
    }

    /// Job property by name
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Local path of the staged job script
    pub fn script_path(&self) -> PathBuf {
        self.staging_dir.join("script")
    }
}

fn read_secret_file(dir: &Path, name: &str) -> Result<String> {
    let path = dir.join(name);
    let value = std::fs::read_to_string(&path)
        .map_err(|e| WatcherError::config(format!("cannot read {}: {e}", path.display())))?;
    let value = value.trim().to_string();
    if value.is_empty() {
        return Err(WatcherError::config(format!("{} is empty", path.display())));
    }
    Ok(value)
}

/// Remote scheduler credentials
///
/// LSF uses them to log on, SLURM as user name and token, the quantum backend
/// as service CRN and API key.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Read `username` and `password` from a mounted secret directory
    pub fn load(dir: &Path) -> Result<Self> {
        Ok(Self {
            username: read_secret_file(dir, "username")?,
            password: read_secret_file(dir, "password")?,
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Object storage credentials
#[derive(Clone)]
pub struct StorageCredentials {
    pub access_key: String,
    pub secret_key: String,
}

impl StorageCredentials {
    /// Read `accesskey` and `secretkey` from a mounted secret directory
    pub fn load(dir: &Path) -> Result<Self> {
        Ok(Self {
            access_key: read_secret_file(dir, "accesskey")?,
            secret_key: read_secret_file(dir, "secretkey")?,
        })
    }
}

impl std::fmt::Debug for StorageCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageCredentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}
