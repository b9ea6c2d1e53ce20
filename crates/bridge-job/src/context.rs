//! Execution context builders
//!
//! Everything the controller creates for a job has a deterministic name
//! derived from the job name, so a create repeated after a stale read lands on
//! the existing object instead of a duplicate.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMap, Container, EnvVar, Pod, PodSpec, ResourceRequirements, SecretVolumeSource,
    ServiceAccount, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

use bridge_common::crd::BridgeJob;
use bridge_common::record::CoordinationRecord;
use bridge_common::BackendKind;

use crate::error::JobError;

/// Service account the watcher pod runs as
pub const SERVICE_ACCOUNT: &str = "bridge-cm-viewer";
/// Role granting access to coordination records
pub const ROLE: &str = "bridge-cm-role";
/// Binding of [`ROLE`] to [`SERVICE_ACCOUNT`]
pub const ROLE_BINDING: &str = "bridge-cm-binding";

/// Mount path of the remote scheduler credentials
pub const CREDENTIALS_PATH: &str = "/credentials";
/// Mount path of the object storage credentials
pub const STORAGE_CREDENTIALS_PATH: &str = "/s3credentials";

const CPU_REQUEST: &str = "250m";
const CPU_LIMIT: &str = "500m";
const MEMORY: &str = "100Mi";

/// Label carrying the owning job name
pub const JOB_LABEL: &str = "bridge.dev/job";
const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const MANAGED_BY: &str = "bridge-operator";

/// Watcher pod name for a job
pub fn pod_name(job_name: &str) -> String {
    format!("{job_name}-bridge-pod")
}

/// Watcher container name for a job
pub fn container_name(job_name: &str) -> String {
    format!("{job_name}-bridge-cont")
}

fn labels(job_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (JOB_LABEL.to_string(), job_name.to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
    ])
}

fn owner_reference(job: &BridgeJob) -> Result<OwnerReference, JobError> {
    job.controller_owner_ref(&())
        .ok_or_else(|| JobError::MissingUid(job.name_any()))
}

fn namespace(job: &BridgeJob) -> Result<String, JobError> {
    job.namespace().ok_or(JobError::MissingNamespace)
}

/// Coordination record seeded from the job spec and any prior status
pub fn build_record(job: &BridgeJob, backend: Option<BackendKind>) -> Result<ConfigMap, JobError> {
    let name = job.name_any();
    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(bridge_common::record_name(&name)),
            namespace: Some(namespace(job)?),
            labels: Some(labels(&name)),
            owner_references: Some(vec![owner_reference(job)?]),
            ..Default::default()
        },
        data: Some(CoordinationRecord::initial_data(
            &job.spec,
            job.status.as_ref(),
            backend,
        )),
        ..Default::default()
    })
}

fn quantities(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_string(), Quantity(cpu.to_string())),
        ("memory".to_string(), Quantity(memory.to_string())),
    ])
}

fn secret_volume(name: &str, secret: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn read_only_mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

/// Watcher pod hosting the Watcher Engine for one job
pub fn build_pod(job: &BridgeJob) -> Result<Pod, JobError> {
    let name = job.name_any();
    let ns = namespace(job)?;

    let mut volumes = vec![secret_volume("credentials", &job.spec.resource_secret)];
    let mut mounts = vec![read_only_mount("credentials", CREDENTIALS_PATH)];
    if let Some(secret) = job.spec.storage_secret() {
        volumes.push(secret_volume("s3credentials", secret));
        mounts.push(read_only_mount("s3credentials", STORAGE_CREDENTIALS_PATH));
    }

    let container = Container {
        name: container_name(&name),
        image: Some(job.spec.image.clone()),
        image_pull_policy: Some(job.spec.image_pull_policy.clone()),
        env: Some(vec![
            EnvVar {
                name: "NAMESPACE".to_string(),
                value: Some(ns.clone()),
                ..Default::default()
            },
            EnvVar {
                name: "JOBNAME".to_string(),
                value: Some(name.clone()),
                ..Default::default()
            },
        ]),
        resources: Some(ResourceRequirements {
            requests: Some(quantities(CPU_REQUEST, MEMORY)),
            limits: Some(quantities(CPU_LIMIT, MEMORY)),
            ..Default::default()
        }),
        volume_mounts: Some(mounts),
        ..Default::default()
    };

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(pod_name(&name)),
            namespace: Some(ns),
            labels: Some(labels(&name)),
            owner_references: Some(vec![owner_reference(job)?]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            service_account_name: Some(SERVICE_ACCOUNT.to_string()),
            containers: vec![container],
            volumes: Some(volumes),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Namespace-scoped RBAC letting watcher pods read and write records
#[derive(Clone, Debug)]
pub struct WatcherRbac {
    pub service_account: ServiceAccount,
    pub role: Role,
    pub role_binding: RoleBinding,
}

impl WatcherRbac {
    pub fn for_namespace(namespace: &str) -> Self {
        let meta = |name: &str| ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGED_BY.to_string(),
            )])),
            ..Default::default()
        };

        let role = Role {
            metadata: meta(ROLE),
            rules: Some(vec![PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["configmaps".to_string()]),
                verbs: ["get", "watch", "list", "update", "patch"]
                    .map(String::from)
                    .to_vec(),
                ..Default::default()
            }]),
        };

        let role_binding = RoleBinding {
            metadata: meta(ROLE_BINDING),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "Role".to_string(),
                name: ROLE.to_string(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: SERVICE_ACCOUNT.to_string(),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            }]),
        };

        Self {
            service_account: ServiceAccount {
                metadata: meta(SERVICE_ACCOUNT),
                ..Default::default()
            },
            role,
            role_binding,
        }
    }
}
