//! Controller runner - builds the controller future for BridgeJob
//!
//! Returning the future keeps construction separate from execution, so the
//! binary decides how it is driven alongside shutdown handling.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use bridge_common::crd::BridgeJob;
use bridge_job::{error_policy, reconcile, JobContext};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Build the BridgeJob controller future
///
/// The controller also watches the Pods and ConfigMaps it owns, so a watcher
/// exiting or writing to the coordination record triggers a reconcile.
pub fn build_job_controller(client: Client) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let ctx = Arc::new(JobContext::new(client.clone()));
    let jobs: Api<BridgeJob> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client.clone());
    let records: Api<ConfigMap> = Api::all(client);

    tracing::info!("- BridgeJob controller");

    Box::pin(
        Controller::new(jobs, watcher_config())
            .owns(pods, watcher_config())
            .owns(records, watcher_config())
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("BridgeJob")),
    )
}

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
