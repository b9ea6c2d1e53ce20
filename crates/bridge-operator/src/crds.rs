//! CRD installation utilities
//!
//! The operator installs the BridgeJob CRD on startup using server-side apply,
//! so upgrading the operator also upgrades the schema.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use bridge_common::crd::BridgeJob;
use bridge_common::FIELD_MANAGER;

/// Full name of the BridgeJob CRD
pub const BRIDGE_JOB_CRD: &str = "bridgejobs.bridge.dev";

/// BridgeJob CRD rendered as YAML
pub fn crd_yaml() -> anyhow::Result<String> {
    serde_yaml::to_string(&BridgeJob::crd())
        .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {}", e))
}

/// Ensure the BridgeJob CRD is installed and current
pub async fn ensure_crds(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!(crd = BRIDGE_JOB_CRD, "installing CRD");
    crds.patch(BRIDGE_JOB_CRD, &params, &Patch::Apply(&BridgeJob::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", BRIDGE_JOB_CRD, e))?;
    tracing::info!(crd = BRIDGE_JOB_CRD, "CRD installed/updated");
    Ok(())
}
