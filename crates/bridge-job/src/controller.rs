//! BridgeJob controller implementation
//!
//! Each reconcile walks the same ladder and stops at the first rung that
//! needs work:
//! - coordination record (created after storage preconditions pass)
//! - watcher pod (created after credential checks, with its RBAC)
//! - watcher pod failure classification
//! - kill relay into the record
//! - status projection from the record onto the resource
//!
//! The controller never talks to the watcher directly; everything flows
//! through the record. Reads may be stale, so every create is keyed by a
//! deterministic name and tolerates "already exists".

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use bridge_common::crd::{BridgeJob, BridgeJobSpec, BridgeJobStatus};
use bridge_common::metrics::{JobEvent, MetricsRecorder, OtelRecorder};
#[cfg(test)]
use bridge_common::metrics::NoopRecorder;
use bridge_common::record::{keys, merge_patch, CoordinationRecord, RecordUpdate};
use bridge_common::time::minutes_between;
use bridge_common::{record_name, BackendKind, JobStatus, FIELD_MANAGER};

use crate::context::{build_pod, build_record, pod_name, WatcherRbac};
use crate::error::JobError;

/// Fields a resource credential secret must carry
const RESOURCE_CREDENTIAL_FIELDS: [&str; 2] = ["username", "password"];
/// Fields an object storage credential secret must carry
const STORAGE_CREDENTIAL_FIELDS: [&str; 2] = ["accesskey", "secretkey"];

// =============================================================================
// Kubernetes seam
// =============================================================================

/// Cluster operations needed by the reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Fetch a BridgeJob; `None` when it no longer exists
    async fn get_job(&self, name: &str, namespace: &str) -> Result<Option<BridgeJob>, JobError>;

    /// Merge-patch the status subresource
    async fn patch_job_status(
        &self,
        name: &str,
        namespace: &str,
        status: &BridgeJobStatus,
    ) -> Result<(), JobError>;

    /// Fetch a coordination record
    async fn get_record(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<CoordinationRecord>, JobError>;

    /// Create a coordination record; an existing one is left untouched
    async fn create_record(&self, namespace: &str, record: &ConfigMap) -> Result<(), JobError>;

    /// Merge the given keys into a coordination record
    async fn patch_record(
        &self,
        name: &str,
        namespace: &str,
        update: &RecordUpdate,
    ) -> Result<(), JobError>;

    /// Fetch a pod
    async fn get_pod(&self, name: &str, namespace: &str) -> Result<Option<Pod>, JobError>;

    /// Create a pod; an existing one is left untouched
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), JobError>;

    /// Fetch a secret
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, JobError>;

    /// Create whichever of the watcher's ServiceAccount, Role and RoleBinding are missing
    async fn ensure_watcher_rbac(&self, namespace: &str, rbac: &WatcherRbac)
        -> Result<(), JobError>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get_optional<K>(&self, name: &str, namespace: &str) -> Result<Option<K>, JobError>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_if_absent<K>(&self, namespace: &str, obj: &K) -> Result<(), JobError>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + std::fmt::Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let created = created_or_exists(api.create(&PostParams::default(), obj).await)?;
        if !created {
            debug!(
                kind = %K::kind(&()),
                name = %obj.name_any(),
                "already exists"
            );
        }
        Ok(())
    }
}

/// Map a create result to whether the object was newly created
///
/// A 409 means a concurrent or earlier reconcile got there first.
pub fn created_or_exists<T>(result: Result<T, kube::Error>) -> Result<bool, kube::Error> {
    match result {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_job(&self, name: &str, namespace: &str) -> Result<Option<BridgeJob>, JobError> {
        self.get_optional(name, namespace).await
    }

    async fn patch_job_status(
        &self,
        name: &str,
        namespace: &str,
        status: &BridgeJobStatus,
    ) -> Result<(), JobError> {
        let api: Api<BridgeJob> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = serde_json::json!({ "status": status });
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;
        Ok(())
    }

    async fn get_record(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<CoordinationRecord>, JobError> {
        Ok(self
            .get_optional::<ConfigMap>(name, namespace)
            .await?
            .map(|cm| CoordinationRecord::from_config_map(&cm)))
    }

    async fn create_record(&self, namespace: &str, record: &ConfigMap) -> Result<(), JobError> {
        self.create_if_absent(namespace, record).await
    }

    async fn patch_record(
        &self,
        name: &str,
        namespace: &str,
        update: &RecordUpdate,
    ) -> Result<(), JobError> {
        if update.is_empty() {
            return Ok(());
        }
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&merge_patch(update)),
        )
        .await?;
        Ok(())
    }

    async fn get_pod(&self, name: &str, namespace: &str) -> Result<Option<Pod>, JobError> {
        self.get_optional(name, namespace).await
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), JobError> {
        self.create_if_absent(namespace, pod).await
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, JobError> {
        self.get_optional(name, namespace).await
    }

    async fn ensure_watcher_rbac(
        &self,
        namespace: &str,
        rbac: &WatcherRbac,
    ) -> Result<(), JobError> {
        self.create_if_absent(namespace, &rbac.service_account).await?;
        self.create_if_absent(namespace, &rbac.role).await?;
        self.create_if_absent(namespace, &rbac.role_binding).await?;
        Ok(())
    }
}

// =============================================================================
// Context
// =============================================================================

/// Shared context for the BridgeJob controller
pub struct JobContext {
    pub kube: Arc<dyn KubeClient>,
    pub recorder: Arc<dyn MetricsRecorder>,
}

impl JobContext {
    /// Create a context backed by the cluster and the global meter
    pub fn new(client: Client) -> Self {
        Self {
            kube: Arc::new(KubeClientImpl::new(client)),
            recorder: Arc::new(OtelRecorder),
        }
    }

    /// Create a context with explicit collaborators
    pub fn with_parts(kube: Arc<dyn KubeClient>, recorder: Arc<dyn MetricsRecorder>) -> Self {
        Self { kube, recorder }
    }

    /// Create a context for testing with a mock client and no metrics
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>) -> Self {
        Self {
            kube,
            recorder: Arc::new(NoopRecorder),
        }
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile a BridgeJob resource
#[instrument(skip(job, ctx), fields(job = %job.name_any()))]
pub async fn reconcile(job: Arc<BridgeJob>, ctx: Arc<JobContext>) -> Result<Action, JobError> {
    let name = job.name_any();
    let namespace = job.namespace().ok_or(JobError::MissingNamespace)?;

    // The cached object can trail our own status writes
    let Some(job) = ctx.kube.get_job(&name, &namespace).await? else {
        debug!("BridgeJob deleted");
        return Ok(Action::await_change());
    };
    if let Some(status) = job.job_status().filter(JobStatus::halts_reconcile) {
        debug!(status = %status, "job is terminal");
        return Ok(Action::await_change());
    }

    let backend = job.spec.resolved_backend();
    let record_name = record_name(&name);

    let record = match ctx.kube.get_record(&record_name, &namespace).await? {
        Some(record) => record,
        None => {
            if let Some(reason) = storage_precondition(&job.spec) {
                return fail_job(&ctx, &job, None, &format!("BridgeJob {name}"), reason).await;
            }
            let cm = build_record(&job, backend)?;
            ctx.kube.create_record(&namespace, &cm).await?;
            info!(record = %record_name, "created coordination record");
            CoordinationRecord::from_config_map(&cm)
        }
    };

    let pod_name = pod_name(&name);
    match ctx.kube.get_pod(&pod_name, &namespace).await? {
        None => {
            if let Some(secret) = secret_missing_credentials(&ctx, &job, &namespace).await? {
                let reason = format!("secret {secret} with credentials missing data");
                return fail_job(&ctx, &job, Some(&record_name), &format!("secret {secret}"), &reason)
                    .await;
            }
            ctx.kube
                .ensure_watcher_rbac(&namespace, &WatcherRbac::for_namespace(&namespace))
                .await?;
            ctx.kube.create_pod(&namespace, &build_pod(&job)?).await?;
            ctx.recorder.record(JobEvent::ContextCreated, backend);
            info!(pod = %pod_name, backend = ?backend, "created watcher pod");
            return Ok(Action::await_change());
        }
        Some(pod) if pod_failed(&pod) => {
            let attributed = matches!(record.job_status(), Some(JobStatus::Kill | JobStatus::Failed));
            if !attributed {
                ctx.recorder.record(JobEvent::ContextFailed, backend);
                let reason = format!(
                    "Pod for BridgeJob {name} in error state while running, see logs for {pod_name}"
                );
                return fail_job(&ctx, &job, Some(&record_name), &format!("pod {pod_name}"), &reason)
                    .await;
            }
        }
        Some(_) => {}
    }

    if job.spec.kill && !record.kill_requested() {
        ctx.kube
            .patch_record(
                &record_name,
                &namespace,
                &RecordUpdate::new().set(keys::KILL, "true"),
            )
            .await?;
        ctx.recorder.record(JobEvent::ContextKilled, backend);
        info!("relayed kill request to watcher");
        return Ok(Action::await_change());
    }

    project_status(&ctx, &job, &namespace, &record, backend).await
}

/// Error policy for BridgeJob reconciliation
pub fn error_policy(job: Arc<BridgeJob>, error: &JobError, _ctx: Arc<JobContext>) -> Action {
    error!(
        ?error,
        job = %job.name_any(),
        "BridgeJob reconciliation failed"
    );
    Action::requeue(Duration::from_secs(30))
}

/// Reason a job cannot get a record, if its storage settings are unusable
fn storage_precondition(spec: &BridgeJobSpec) -> Option<&'static str> {
    match spec.s3_storage.as_ref().filter(|s| !s.s3_secret.is_empty()) {
        None if spec.storage_implied() => {
            Some("S3 access is not defined but used in configuration")
        }
        Some(storage) if storage.endpoint.trim().is_empty() => {
            Some("BridgeJob spec missing S3 endpoint")
        }
        _ => None,
    }
}

fn secret_has_fields(secret: &Secret, fields: &[&str]) -> bool {
    fields.iter().all(|field| {
        let in_data = secret
            .data
            .as_ref()
            .and_then(|d| d.get(*field))
            .is_some_and(|v| !v.0.is_empty());
        let in_string_data = secret
            .string_data
            .as_ref()
            .and_then(|d| d.get(*field))
            .is_some_and(|v| !v.is_empty());
        in_data || in_string_data
    })
}

/// Name of the first referenced secret that is absent or lacks a required field
async fn secret_missing_credentials(
    ctx: &JobContext,
    job: &BridgeJob,
    namespace: &str,
) -> Result<Option<String>, JobError> {
    let mut required = vec![(job.spec.resource_secret.as_str(), RESOURCE_CREDENTIAL_FIELDS)];
    if let Some(secret) = job.spec.storage_secret() {
        required.push((secret, STORAGE_CREDENTIAL_FIELDS));
    }

    for (secret_name, fields) in required {
        let complete = ctx
            .kube
            .get_secret(secret_name, namespace)
            .await?
            .is_some_and(|s| secret_has_fields(&s, &fields));
        if !complete {
            return Ok(Some(secret_name.to_string()));
        }
    }
    Ok(None)
}

fn pod_failed(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Failed")
}

/// Mark the job FAILED and mirror the message into the record when it exists
async fn fail_job(
    ctx: &JobContext,
    job: &BridgeJob,
    record: Option<&str>,
    object: &str,
    reason: &str,
) -> Result<Action, JobError> {
    let name = job.name_any();
    let namespace = job.namespace().ok_or(JobError::MissingNamespace)?;
    let message = format!("Error in object {object} for job {name}, failing BridgeJob: {reason}");
    warn!(job = %name, reason = %reason, "failing BridgeJob");

    let status = BridgeJobStatus {
        job_status: Some(JobStatus::Failed),
        message: Some(message.clone()),
        ..Default::default()
    };
    ctx.kube.patch_job_status(&name, &namespace, &status).await?;

    if let Some(record) = record {
        ctx.kube
            .patch_record(record, &namespace, &RecordUpdate::new().message(message))
            .await?;
    }
    Ok(Action::await_change())
}

/// Copy the record's status onto the resource when they differ
async fn project_status(
    ctx: &JobContext,
    job: &BridgeJob,
    namespace: &str,
    record: &CoordinationRecord,
    backend: Option<BackendKind>,
) -> Result<Action, JobError> {
    let Some(recorded) = record.job_status() else {
        return Ok(Action::await_change());
    };
    let current = job.job_status();
    if current == Some(recorded) {
        return Ok(Action::await_change());
    }

    let status = BridgeJobStatus {
        job_status: Some(recorded),
        start_time: record.submit_time().map(str::to_string),
        completion_time: record.end_time().map(str::to_string),
        message: record.message().map(str::to_string),
    };
    ctx.kube
        .patch_job_status(&job.name_any(), namespace, &status)
        .await?;
    info!(from = ?current, to = %recorded, "projected record status");

    if recorded.is_success() {
        ctx.recorder.record(JobEvent::JobCompleted, backend);
        observe_duration(ctx, record, backend);
    } else if matches!(recorded, JobStatus::Failed | JobStatus::Unknown) {
        ctx.recorder.record(JobEvent::JobFailed, backend);
    }
    Ok(Action::await_change())
}

fn observe_duration(ctx: &JobContext, record: &CoordinationRecord, backend: Option<BackendKind>) {
    let (Some(start), Some(end)) = (record.submit_time(), record.end_time()) else {
        warn!("completed job has no start or end time; duration not recorded");
        return;
    };
    match minutes_between(start, end) {
        Ok(minutes) => ctx.recorder.record_duration(minutes, backend),
        Err(e) => warn!(start = %start, end = %end, error = %e, "cannot parse job timestamps"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use bridge_common::crd::{JobData, S3Storage};
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::ByteString;

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    fn sample_job() -> BridgeJob {
        let mut job = BridgeJob::new(
            "sim",
            BridgeJobSpec {
                image: "bridge/slurm-pod:latest".to_string(),
                image_pull_policy: "IfNotPresent".to_string(),
                resource_url: "http://slurm.example:6820/slurm/v0.0.39".to_string(),
                resource_secret: "slurm-creds".to_string(),
                update_interval: 1,
                kill: false,
                job_data: JobData {
                    job_script: "echo hi".to_string(),
                    ..Default::default()
                },
                job_properties: String::new(),
                s3_storage: None,
                s3_upload: None,
                backend: None,
            },
        );
        job.metadata.namespace = Some("research".to_string());
        job.metadata.uid = Some("0b6f1c3e-1111-2222-3333-444455556666".to_string());
        job
    }

    fn job_with_status(status: JobStatus) -> BridgeJob {
        let mut job = sample_job();
        job.status = Some(BridgeJobStatus {
            job_status: Some(status),
            ..Default::default()
        });
        job
    }

    fn record(pairs: &[(&str, &str)]) -> CoordinationRecord {
        CoordinationRecord::new(
            "sim-bridge-cm",
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn pod_in_phase(phase: &str) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn secret(pairs: &[(&str, &str)]) -> Secret {
        Secret {
            data: Some(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    #[derive(Clone, Default)]
    struct CaptureRecorder {
        events: Arc<Mutex<Vec<(JobEvent, Option<BackendKind>)>>>,
        durations: Arc<Mutex<Vec<f64>>>,
    }

    impl MetricsRecorder for CaptureRecorder {
        fn record(&self, event: JobEvent, backend: Option<BackendKind>) {
            self.events.lock().unwrap().push((event, backend));
        }

        fn record_duration(&self, minutes: f64, _backend: Option<BackendKind>) {
            self.durations.lock().unwrap().push(minutes);
        }
    }

    type Captured<T> = Arc<Mutex<Vec<T>>>;

    fn capture_status(mock: &mut MockKubeClient) -> Captured<BridgeJobStatus> {
        let captured: Captured<BridgeJobStatus> = Arc::default();
        let sink = captured.clone();
        mock.expect_patch_job_status().returning(move |_, _, status| {
            sink.lock().unwrap().push(status.clone());
            Ok(())
        });
        captured
    }

    fn capture_record_patches(mock: &mut MockKubeClient) -> Captured<RecordUpdate> {
        let captured: Captured<RecordUpdate> = Arc::default();
        let sink = captured.clone();
        mock.expect_patch_record().returning(move |_, _, update| {
            sink.lock().unwrap().push(update.clone());
            Ok(())
        });
        captured
    }

    fn returns_job(mock: &mut MockKubeClient, job: BridgeJob) {
        mock.expect_get_job()
            .returning(move |_, _| Ok(Some(job.clone())));
    }

    async fn run(job: BridgeJob, mock: MockKubeClient) -> Action {
        let ctx = Arc::new(JobContext::for_testing(Arc::new(mock)));
        reconcile(Arc::new(job), ctx).await.unwrap()
    }

    async fn run_recorded(job: BridgeJob, mock: MockKubeClient, recorder: CaptureRecorder) -> Action {
        let ctx = Arc::new(JobContext::with_parts(Arc::new(mock), Arc::new(recorder)));
        reconcile(Arc::new(job), ctx).await.unwrap()
    }

    // =========================================================================
    // Terminal and missing resources
    // =========================================================================

    mod short_circuits {
        use super::*;

        #[tokio::test]
        async fn deleted_job_is_noop() {
            let mut mock = MockKubeClient::new();
            mock.expect_get_job().returning(|_, _| Ok(None));
            mock.expect_get_record().never();

            assert_eq!(run(sample_job(), mock).await, Action::await_change());
        }

        #[tokio::test]
        async fn terminal_status_is_never_mutated() {
            for status in [JobStatus::Done, JobStatus::Failed, JobStatus::Kill, JobStatus::Unknown] {
                let mut mock = MockKubeClient::new();
                returns_job(&mut mock, job_with_status(status));
                mock.expect_get_record().never();
                mock.expect_patch_job_status().never();
                mock.expect_patch_record().never();

                assert_eq!(run(sample_job(), mock).await, Action::await_change());
            }
        }
    }

    // =========================================================================
    // Provisioning
    // =========================================================================

    mod provisioning {
        use super::*;

        fn secrets_ok(mock: &mut MockKubeClient) {
            mock.expect_get_secret()
                .returning(|name, _| match name {
                    "minio" => Ok(Some(secret(&[("accesskey", "a"), ("secretkey", "s")]))),
                    _ => Ok(Some(secret(&[("username", "u"), ("password", "p")]))),
                });
        }

        #[tokio::test]
        async fn creates_record_rbac_and_pod() {
            let mut mock = MockKubeClient::new();
            returns_job(&mut mock, sample_job());
            mock.expect_get_record().returning(|_, _| Ok(None));
            mock.expect_create_record()
                .withf(|ns, cm| ns == "research" && cm.metadata.name.as_deref() == Some("sim-bridge-cm"))
                .times(1)
                .returning(|_, _| Ok(()));
            mock.expect_get_pod().returning(|_, _| Ok(None));
            secrets_ok(&mut mock);
            mock.expect_ensure_watcher_rbac()
                .times(1)
                .returning(|_, _| Ok(()));
            mock.expect_create_pod()
                .withf(|_, pod| pod.metadata.name.as_deref() == Some("sim-bridge-pod"))
                .times(1)
                .returning(|_, _| Ok(()));
            mock.expect_patch_job_status().never();

            let recorder = CaptureRecorder::default();
            run_recorded(sample_job(), mock, recorder.clone()).await;

            assert_eq!(
                *recorder.events.lock().unwrap(),
                vec![(JobEvent::ContextCreated, Some(BackendKind::Slurm))]
            );
        }

        #[tokio::test]
        async fn stale_reads_reuse_deterministic_names() {
            let created_pods: Captured<String> = Arc::default();
            let mut mock = MockKubeClient::new();
            returns_job(&mut mock, sample_job());
            // Both passes see neither record nor pod
            mock.expect_get_record().returning(|_, _| Ok(None));
            mock.expect_create_record().times(2).returning(|_, _| Ok(()));
            mock.expect_get_pod().returning(|_, _| Ok(None));
            secrets_ok(&mut mock);
            mock.expect_ensure_watcher_rbac().returning(|_, _| Ok(()));
            let sink = created_pods.clone();
            mock.expect_create_pod().times(2).returning(move |_, pod| {
                sink.lock()
                    .unwrap()
                    .push(pod.metadata.name.clone().unwrap_or_default());
                Ok(())
            });

            let ctx = Arc::new(JobContext::for_testing(Arc::new(mock)));
            reconcile(Arc::new(sample_job()), ctx.clone()).await.unwrap();
            reconcile(Arc::new(sample_job()), ctx).await.unwrap();

            let names = created_pods.lock().unwrap();
            assert_eq!(names.len(), 2);
            assert_eq!(names[0], names[1]);
        }

        #[test]
        fn conflict_on_create_means_exists() {
            let conflict: Result<(), kube::Error> =
                Err(kube::Error::Api(kube::error::ErrorResponse {
                    status: "Failure".to_string(),
                    message: "pods \"sim-bridge-pod\" already exists".to_string(),
                    reason: "AlreadyExists".to_string(),
                    code: 409,
                }));
            assert!(!created_or_exists(conflict).unwrap());
            assert!(created_or_exists(Ok::<(), kube::Error>(())).unwrap());

            let forbidden: Result<(), kube::Error> =
                Err(kube::Error::Api(kube::error::ErrorResponse {
                    status: "Failure".to_string(),
                    message: "forbidden".to_string(),
                    reason: "Forbidden".to_string(),
                    code: 403,
                }));
            assert!(created_or_exists(forbidden).is_err());
        }

        #[tokio::test]
        async fn existing_pod_is_not_recreated() {
            let mut mock = MockKubeClient::new();
            returns_job(&mut mock, job_with_status(JobStatus::Running));
            mock.expect_get_record()
                .returning(|_, _| Ok(Some(record(&[("status.jobStatus", "RUNNING")]))));
            mock.expect_get_pod()
                .returning(|_, _| Ok(Some(pod_in_phase("Running"))));
            mock.expect_create_pod().never();
            mock.expect_create_record().never();
            mock.expect_patch_job_status().never();
            mock.expect_patch_record().never();

            assert_eq!(
                run(job_with_status(JobStatus::Running), mock).await,
                Action::await_change()
            );
        }
    }

    // =========================================================================
    // Precondition failures
    // =========================================================================

    mod preconditions {
        use super::*;

        #[tokio::test]
        async fn storage_usage_without_credentials_fails_before_record() {
            let mut job = sample_job();
            job.spec.job_data.additional_data = "inputs:a.dat".to_string();

            let mut mock = MockKubeClient::new();
            returns_job(&mut mock, job.clone());
            mock.expect_get_record().returning(|_, _| Ok(None));
            mock.expect_create_record().never();
            mock.expect_create_pod().never();
            mock.expect_patch_record().never();
            let statuses = capture_status(&mut mock);

            run(job, mock).await;

            let statuses = statuses.lock().unwrap();
            assert_eq!(statuses.len(), 1);
            assert_eq!(statuses[0].job_status, Some(JobStatus::Failed));
            assert!(statuses[0]
                .message
                .as_deref()
                .unwrap()
                .contains("S3 access is not defined but used in configuration"));
        }

        #[test]
        fn storage_secret_without_endpoint_is_rejected() {
            let mut spec = sample_job().spec;
            spec.s3_storage = Some(S3Storage {
                s3_secret: "minio".to_string(),
                endpoint: " ".to_string(),
                secure: true,
            });
            assert_eq!(
                storage_precondition(&spec),
                Some("BridgeJob spec missing S3 endpoint")
            );

            spec.s3_storage = None;
            assert_eq!(storage_precondition(&spec), None);
        }

        #[tokio::test]
        async fn incomplete_credentials_fail_job_and_annotate_record() {
            let mut mock = MockKubeClient::new();
            returns_job(&mut mock, sample_job());
            mock.expect_get_record()
                .returning(|_, _| Ok(Some(record(&[]))));
            mock.expect_get_pod().returning(|_, _| Ok(None));
            mock.expect_get_secret()
                .returning(|_, _| Ok(Some(secret(&[("username", "u"), ("password", "")]))));
            mock.expect_ensure_watcher_rbac().never();
            mock.expect_create_pod().never();
            let statuses = capture_status(&mut mock);
            let patches = capture_record_patches(&mut mock);

            run(sample_job(), mock).await;

            let statuses = statuses.lock().unwrap();
            assert_eq!(statuses[0].job_status, Some(JobStatus::Failed));
            let message = statuses[0].message.clone().unwrap();
            assert!(message.contains("secret slurm-creds with credentials missing data"));

            let patches = patches.lock().unwrap();
            assert_eq!(patches[0].get(keys::MESSAGE), Some(message.as_str()));
        }

        #[tokio::test]
        async fn absent_secret_fails_job() {
            let mut mock = MockKubeClient::new();
            returns_job(&mut mock, sample_job());
            mock.expect_get_record()
                .returning(|_, _| Ok(Some(record(&[]))));
            mock.expect_get_pod().returning(|_, _| Ok(None));
            mock.expect_get_secret().returning(|_, _| Ok(None));
            mock.expect_create_pod().never();
            let statuses = capture_status(&mut mock);
            mock.expect_patch_record().returning(|_, _, _| Ok(()));

            run(sample_job(), mock).await;
            assert_eq!(
                statuses.lock().unwrap()[0].job_status,
                Some(JobStatus::Failed)
            );
        }

        #[test]
        fn string_data_counts_as_present() {
            let secret = Secret {
                string_data: Some(BTreeMap::from([
                    ("accesskey".to_string(), "a".to_string()),
                    ("secretkey".to_string(), "s".to_string()),
                ])),
                ..Default::default()
            };
            assert!(secret_has_fields(&secret, &STORAGE_CREDENTIAL_FIELDS));
            assert!(!secret_has_fields(&secret, &RESOURCE_CREDENTIAL_FIELDS));
        }
    }

    // =========================================================================
    // Pod failure classification
    // =========================================================================

    mod pod_failures {
        use super::*;

        #[tokio::test]
        async fn unexplained_pod_failure_fails_job() {
            let mut mock = MockKubeClient::new();
            returns_job(&mut mock, job_with_status(JobStatus::Running));
            mock.expect_get_record()
                .returning(|_, _| Ok(Some(record(&[("status.jobStatus", "RUNNING")]))));
            mock.expect_get_pod()
                .returning(|_, _| Ok(Some(pod_in_phase("Failed"))));
            let statuses = capture_status(&mut mock);
            mock.expect_patch_record().returning(|_, _, _| Ok(()));

            let recorder = CaptureRecorder::default();
            run_recorded(job_with_status(JobStatus::Running), mock, recorder.clone()).await;

            let statuses = statuses.lock().unwrap();
            assert_eq!(statuses[0].job_status, Some(JobStatus::Failed));
            assert!(statuses[0]
                .message
                .as_deref()
                .unwrap()
                .contains("see logs for sim-bridge-pod"));
            assert_eq!(
                recorder.events.lock().unwrap()[0].0,
                JobEvent::ContextFailed
            );
        }

        #[tokio::test]
        async fn pod_failure_after_remote_failure_projects_record_status() {
            let mut mock = MockKubeClient::new();
            returns_job(&mut mock, job_with_status(JobStatus::Running));
            mock.expect_get_record().returning(|_, _| {
                Ok(Some(record(&[
                    ("status.jobStatus", "FAILED"),
                    ("status.message", "remote job exited 1"),
                ])))
            });
            mock.expect_get_pod()
                .returning(|_, _| Ok(Some(pod_in_phase("Failed"))));
            mock.expect_patch_record().never();
            let statuses = capture_status(&mut mock);

            let recorder = CaptureRecorder::default();
            run_recorded(job_with_status(JobStatus::Running), mock, recorder.clone()).await;

            let statuses = statuses.lock().unwrap();
            assert_eq!(statuses[0].job_status, Some(JobStatus::Failed));
            assert_eq!(statuses[0].message.as_deref(), Some("remote job exited 1"));
            assert_eq!(recorder.events.lock().unwrap()[0].0, JobEvent::JobFailed);
        }
    }

    // =========================================================================
    // Kill relay
    // =========================================================================

    mod kill {
        use super::*;

        fn killed_job() -> BridgeJob {
            let mut job = job_with_status(JobStatus::Running);
            job.spec.kill = true;
            job
        }

        #[tokio::test]
        async fn kill_flag_is_written_once() {
            let mut mock = MockKubeClient::new();
            returns_job(&mut mock, killed_job());
            mock.expect_get_record()
                .returning(|_, _| Ok(Some(record(&[("status.jobStatus", "RUNNING")]))));
            mock.expect_get_pod()
                .returning(|_, _| Ok(Some(pod_in_phase("Running"))));
            mock.expect_patch_job_status().never();
            let patches = capture_record_patches(&mut mock);

            run(killed_job(), mock).await;

            let patches = patches.lock().unwrap();
            assert_eq!(patches.len(), 1);
            assert_eq!(patches[0].get(keys::KILL), Some("true"));
        }

        #[tokio::test]
        async fn kill_already_relayed_is_not_rewritten() {
            let mut mock = MockKubeClient::new();
            returns_job(&mut mock, killed_job());
            mock.expect_get_record().returning(|_, _| {
                Ok(Some(record(&[("status.jobStatus", "RUNNING"), ("kill", "true")])))
            });
            mock.expect_get_pod()
                .returning(|_, _| Ok(Some(pod_in_phase("Running"))));
            mock.expect_patch_record().never();
            mock.expect_patch_job_status().never();

            run(killed_job(), mock).await;
        }
    }

    // =========================================================================
    // Status projection
    // =========================================================================

    mod projection {
        use super::*;

        fn running_pod(mock: &mut MockKubeClient) {
            mock.expect_get_pod()
                .returning(|_, _| Ok(Some(pod_in_phase("Succeeded"))));
        }

        #[tokio::test]
        async fn completion_projects_times_and_duration() {
            let mut mock = MockKubeClient::new();
            returns_job(&mut mock, job_with_status(JobStatus::Running));
            mock.expect_get_record().returning(|_, _| {
                Ok(Some(record(&[
                    ("status.jobStatus", "DONE"),
                    ("status.submitTime", "2024-03-01T12:00:00Z"),
                    ("status.endTime", "2024-03-01T12:30:00Z"),
                    ("status.message", "Output and error files can be found in your home directory"),
                ])))
            });
            running_pod(&mut mock);
            let statuses = capture_status(&mut mock);

            let recorder = CaptureRecorder::default();
            run_recorded(job_with_status(JobStatus::Running), mock, recorder.clone()).await;

            let statuses = statuses.lock().unwrap();
            assert_eq!(
                statuses[0],
                BridgeJobStatus {
                    job_status: Some(JobStatus::Done),
                    start_time: Some("2024-03-01T12:00:00Z".to_string()),
                    completion_time: Some("2024-03-01T12:30:00Z".to_string()),
                    message: Some(
                        "Output and error files can be found in your home directory".to_string()
                    ),
                }
            );
            assert_eq!(*recorder.durations.lock().unwrap(), vec![30.0]);
            assert_eq!(
                recorder.events.lock().unwrap()[0],
                (JobEvent::JobCompleted, Some(BackendKind::Slurm))
            );
        }

        #[tokio::test]
        async fn unparsable_timestamps_do_not_block_projection() {
            let mut mock = MockKubeClient::new();
            returns_job(&mut mock, job_with_status(JobStatus::Running));
            mock.expect_get_record().returning(|_, _| {
                Ok(Some(record(&[
                    ("status.jobStatus", "SUCCEEDED"),
                    ("status.submitTime", "yesterday"),
                    ("status.endTime", "today"),
                ])))
            });
            running_pod(&mut mock);
            let statuses = capture_status(&mut mock);

            let recorder = CaptureRecorder::default();
            run_recorded(job_with_status(JobStatus::Running), mock, recorder.clone()).await;

            assert_eq!(
                statuses.lock().unwrap()[0].job_status,
                Some(JobStatus::Succeeded)
            );
            assert!(recorder.durations.lock().unwrap().is_empty());
        }

        #[tokio::test]
        async fn second_reconcile_writes_nothing() {
            let mut mock = MockKubeClient::new();
            returns_job(&mut mock, job_with_status(JobStatus::Submitted));
            mock.expect_get_record().returning(|_, _| {
                Ok(Some(record(&[("status.jobStatus", "SUBMITTED"), ("id", "42")])))
            });
            running_pod(&mut mock);
            mock.expect_patch_job_status().never();
            mock.expect_patch_record().never();
            mock.expect_create_record().never();
            mock.expect_create_pod().never();

            let ctx = Arc::new(JobContext::for_testing(Arc::new(mock)));
            let job = Arc::new(job_with_status(JobStatus::Submitted));
            reconcile(job.clone(), ctx.clone()).await.unwrap();
            reconcile(job, ctx).await.unwrap();
        }

        #[tokio::test]
        async fn record_without_status_is_left_alone() {
            let mut mock = MockKubeClient::new();
            returns_job(&mut mock, sample_job());
            mock.expect_get_record()
                .returning(|_, _| Ok(Some(record(&[("id", "")]))));
            running_pod(&mut mock);
            mock.expect_patch_job_status().never();

            run(sample_job(), mock).await;
        }
    }

    #[test]
    fn error_policy_requeues() {
        let ctx = Arc::new(JobContext::for_testing(Arc::new(MockKubeClient::new())));
        let action = error_policy(Arc::new(sample_job()), &JobError::MissingNamespace, ctx);
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    }
}
