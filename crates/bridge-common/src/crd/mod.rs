//! Custom Resource Definitions for the job bridge

mod bridge_job;

pub use bridge_job::{
    BridgeJob, BridgeJobSpec, BridgeJobStatus, ExtraLocation, JobData, S3Storage, S3Upload,
    ScriptLocation,
};
