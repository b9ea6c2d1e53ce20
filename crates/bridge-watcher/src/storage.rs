//! Object storage capability
//!
//! The stager only needs get, put and bucket-ensure. [`S3Store`] provides them
//! against any S3-compatible endpoint using path-style addressing.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use s3::creds::Credentials as S3Credentials;
use s3::{Bucket, BucketConfiguration, Region};
use tracing::info;

use bridge_common::record::StorageConfig;

use crate::config::StorageCredentials;
use crate::error::StorageError;

const DEFAULT_REGION: &str = "us-east-1";

/// `bucket:object` reference as written in job data
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectLocation {
    pub bucket: String,
    pub object: String,
}

impl ObjectLocation {
    pub fn parse(reference: &str) -> Result<Self, StorageError> {
        match reference.trim().split_once(':') {
            Some((bucket, object)) if !bucket.trim().is_empty() && !object.trim().is_empty() => {
                Ok(Self {
                    bucket: bucket.trim().to_string(),
                    object: object.trim().to_string(),
                })
            }
            _ => Err(StorageError::InvalidLocation(reference.to_string())),
        }
    }

    /// Last path segment of the object key
    pub fn file_name(&self) -> &str {
        self.object.rsplit('/').next().unwrap_or(&self.object)
    }
}

/// Minimal object store used by the stager
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn put(&self, bucket: &str, key: &str, content: &[u8]) -> Result<(), StorageError>;

    /// Create the bucket unless it already exists
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StorageError>;
}

/// S3-compatible store
pub struct S3Store {
    region: Region,
    credentials: S3Credentials,
}

/// Endpoint URL with the scheme implied by the secure flag
fn endpoint_url(endpoint: &str, secure: bool) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.trim_end_matches('/').to_string();
    }
    let scheme = if secure { "https" } else { "http" };
    format!("{scheme}://{}", endpoint.trim_end_matches('/'))
}

impl S3Store {
    pub fn new(config: &StorageConfig, credentials: &StorageCredentials) -> Result<Self, StorageError> {
        let credentials = S3Credentials::new(
            Some(&credentials.access_key),
            Some(&credentials.secret_key),
            None,
            None,
            None,
        )
        .map_err(|e| StorageError::Credentials(e.to_string()))?;

        Ok(Self {
            region: Region::Custom {
                region: DEFAULT_REGION.to_string(),
                endpoint: endpoint_url(&config.endpoint, config.secure),
            },
            credentials,
        })
    }

    fn bucket(&self, name: &str) -> Result<Box<Bucket>, StorageError> {
        Ok(Bucket::new(name, self.region.clone(), self.credentials.clone())?.with_path_style())
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket(bucket)?.get_object(key).await?;
        Ok(response.bytes().to_vec())
    }

    async fn put(&self, bucket: &str, key: &str, content: &[u8]) -> Result<(), StorageError> {
        self.bucket(bucket)?.put_object(key, content).await?;
        Ok(())
    }

    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        if self.bucket(bucket)?.exists().await? {
            return Ok(());
        }
        Bucket::create_with_path_style(
            bucket,
            self.region.clone(),
            self.credentials.clone(),
            BucketConfiguration::default(),
        )
        .await?;
        info!(bucket, "created bucket");
        Ok(())
    }
}
