//! Bridge watcher - submits one BridgeJob to its remote scheduler and follows it to completion

use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use bridge_common::metrics::OtelRecorder;
use bridge_common::record::{ConfigMapRecordStore, RecordStore};
use bridge_common::telemetry::{init_telemetry, TelemetryConfig};
use bridge_common::WATCHER_FIELD_MANAGER;
use bridge_watcher::config::{Credentials, StorageCredentials};
use bridge_watcher::stager::ArtifactStager;
use bridge_watcher::storage::{ObjectStore, S3Store};
use bridge_watcher::{create_backend, WatcherArgs, WatcherEngine, WatcherError, WatcherSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install crypto provider: {e:?}");
        std::process::exit(1);
    }

    let mut telemetry = init_telemetry(TelemetryConfig::for_service("bridge-watcher"))?;
    let args = WatcherArgs::parse();

    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "watcher failed");
            1
        }
    };

    telemetry.shutdown();
    std::process::exit(code);
}

async fn run(args: WatcherArgs) -> Result<i32, WatcherError> {
    let client = Client::try_default()
        .await
        .map_err(|e| WatcherError::config(format!("cannot build kubernetes client: {e}")))?;
    let records: Arc<dyn RecordStore> = Arc::new(ConfigMapRecordStore::new(
        client,
        &args.namespace,
        &args.job_name,
        WATCHER_FIELD_MANAGER,
    ));

    let record = records.load().await?;
    let settings = Arc::new(WatcherSettings::from_record(&args, &record)?);
    info!(
        job = %settings.job_name,
        backend = %settings.backend,
        resource_url = %settings.resource_url,
        interval = ?settings.poll_interval,
        "watcher starting"
    );

    let credentials = Credentials::load(&args.credentials_dir)?;
    let store: Option<Arc<dyn ObjectStore>> = match &settings.storage {
        Some(config) => {
            let keys = StorageCredentials::load(&args.storage_credentials_dir)?;
            Some(Arc::new(S3Store::new(config, &keys)?))
        }
        None => None,
    };

    let backend = create_backend(&settings, credentials)?;
    let engine = WatcherEngine::new(
        settings.clone(),
        records,
        Arc::from(backend),
        ArtifactStager::new(settings, store),
        Arc::new(OtelRecorder),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let outcome = engine.run(shutdown).await?;
    info!(?outcome, "watcher finished");
    Ok(outcome.exit_code())
}

/// Cancel `token` on SIGINT or SIGTERM
async fn wait_for_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
    token.cancel();
}
