//! Reconciler error types

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Common(#[from] bridge_common::Error),

    #[error("missing namespace on BridgeJob")]
    MissingNamespace,

    #[error("BridgeJob {0} has no uid; cannot set owner reference")]
    MissingUid(String),
}
