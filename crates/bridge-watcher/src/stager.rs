//! Artifact stager
//!
//! Moves job inputs and outputs between object storage, the local staging
//! directory and the remote scheduler. Per-file failures are logged and
//! skipped; only a missing store or an unusable bucket fails a whole batch.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use bridge_common::crd::{ExtraLocation, ScriptLocation};

use crate::backend::{BackendAdapter, ScriptPayload, SubmitRequest};
use crate::config::WatcherSettings;
use crate::error::StorageError;
use crate::storage::{ObjectLocation, ObjectStore};

/// Key of the staged script in the output bucket
const SCRIPT_OBJECT: &str = "script";

/// What an output upload achieved
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UploadReport {
    /// Object keys written
    pub uploaded: Vec<String>,
    /// Files that could not be fetched or stored
    pub skipped: Vec<String>,
}

pub struct ArtifactStager {
    settings: Arc<WatcherSettings>,
    store: Option<Arc<dyn ObjectStore>>,
}

fn io_error(path: &std::path::Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.display().to_string(),
        source,
    }
}

impl ArtifactStager {
    pub fn new(settings: Arc<WatcherSettings>, store: Option<Arc<dyn ObjectStore>>) -> Self {
        Self { settings, store }
    }

    fn store(&self) -> Result<&dyn ObjectStore, StorageError> {
        self.store
            .as_deref()
            .ok_or_else(|| StorageError::Credentials("object storage is not configured".to_string()))
    }

    /// Read a `bucket:object` reference as text
    pub async fn fetch_object(&self, reference: &str) -> Result<String, StorageError> {
        let location = ObjectLocation::parse(reference)?;
        let content = self.store()?.get(&location.bucket, &location.object).await?;
        Ok(String::from_utf8_lossy(&content).into_owned())
    }

    async fn resolve_extra(&self, value: Option<&str>) -> Result<Option<String>, StorageError> {
        match (value, self.settings.payload.extra_location) {
            (None, _) => Ok(None),
            (Some(text), ExtraLocation::Inline) => Ok(Some(text.to_string())),
            (Some(reference), ExtraLocation::S3) => Ok(Some(self.fetch_object(reference).await?)),
        }
    }

    /// Resolve script, metadata and parameters into a submission, staging the script locally
    pub async fn stage_submission(&self) -> Result<SubmitRequest, StorageError> {
        let payload = &self.settings.payload;
        let script = match payload.script_location {
            ScriptLocation::Remote => ScriptPayload::Remote(payload.script.clone()),
            ScriptLocation::Inline => ScriptPayload::Content(payload.script.clone()),
            ScriptLocation::S3 => ScriptPayload::Content(self.fetch_object(&payload.script).await?),
        };

        if let ScriptPayload::Content(content) = &script {
            let path = self.settings.script_path();
            tokio::fs::create_dir_all(&self.settings.staging_dir)
                .await
                .map_err(|e| io_error(&self.settings.staging_dir, e))?;
            tokio::fs::write(&path, content)
                .await
                .map_err(|e| io_error(&path, e))?;
        }

        Ok(SubmitRequest {
            job_name: self.settings.job_name.clone(),
            script,
            metadata: self.resolve_extra(payload.metadata.as_deref()).await?,
            parameters: self.resolve_extra(payload.parameters.as_deref()).await?,
        })
    }

    /// Download `bucket:object` inputs into the staging directory and push them to the backend
    pub async fn download_inputs(
        &self,
        backend: &dyn BackendAdapter,
    ) -> Result<Vec<PathBuf>, StorageError> {
        let references = &self.settings.payload.additional_data;
        if references.is_empty() {
            return Ok(Vec::new());
        }
        let store = self.store()?;
        tokio::fs::create_dir_all(&self.settings.staging_dir)
            .await
            .map_err(|e| io_error(&self.settings.staging_dir, e))?;

        let mut staged = Vec::new();
        for reference in references {
            let location = match ObjectLocation::parse(reference) {
                Ok(location) => location,
                Err(e) => {
                    warn!(error = %e, "skipping input");
                    continue;
                }
            };
            let content = match store.get(&location.bucket, &location.object).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(reference = %reference, error = %e, "failed to download input, skipping");
                    continue;
                }
            };
            let path = self.settings.staging_dir.join(location.file_name());
            if let Err(e) = tokio::fs::write(&path, &content).await {
                warn!(path = %path.display(), error = %e, "failed to stage input, skipping");
                continue;
            }
            if let Err(e) = backend.stage_input(&path).await {
                warn!(path = %path.display(), error = %e, "failed to push input to the remote host");
            }
            info!(reference = %reference, path = %path.display(), "staged input");
            staged.push(path);
        }
        Ok(staged)
    }

    /// Whether outputs are destined for object storage
    pub fn uploads_enabled(&self) -> bool {
        self.store.is_some() && self.settings.upload.is_some()
    }

    /// Fetch outputs from the backend and store them under `<job>/<file>`
    pub async fn upload_outputs(
        &self,
        backend: &dyn BackendAdapter,
        remote_id: &str,
    ) -> Result<UploadReport, StorageError> {
        let (Some(store), Some(upload)) = (self.store.as_deref(), self.settings.upload.as_ref())
        else {
            return Ok(UploadReport::default());
        };
        store.ensure_bucket(&upload.bucket).await?;

        let job = &self.settings.job_name;
        let mut report = UploadReport::default();

        if self.settings.payload.script_location != ScriptLocation::S3 {
            let path = self.settings.script_path();
            if let Ok(content) = tokio::fs::read(&path).await {
                let key = format!("{job}/{SCRIPT_OBJECT}");
                match store.put(&upload.bucket, &key, &content).await {
                    Ok(()) => report.uploaded.push(key),
                    Err(e) => {
                        warn!(key = %key, error = %e, "failed to upload script");
                        report.skipped.push(SCRIPT_OBJECT.to_string());
                    }
                }
            }
        }

        for file in backend.output_files() {
            let name = file.rsplit('/').next().unwrap_or(&file).to_string();
            let content = match backend.fetch_output(remote_id, &file).await {
                Ok(Some(content)) => content,
                Ok(None) => {
                    info!(file = %file, "output is empty, not uploading");
                    continue;
                }
                Err(e) => {
                    warn!(file = %file, error = %e, "failed to fetch output, skipping");
                    report.skipped.push(file);
                    continue;
                }
            };
            let key = format!("{job}/{name}");
            match store.put(&upload.bucket, &key, &content).await {
                Ok(()) => report.uploaded.push(key),
                Err(e) => {
                    warn!(key = %key, error = %e, "failed to upload output, skipping");
                    report.skipped.push(file);
                }
            }
        }

        info!(
            bucket = %upload.bucket,
            uploaded = report.uploaded.len(),
            skipped = report.skipped.len(),
            "uploaded outputs"
        );
        Ok(report)
    }
}
