//! Bridge operator - runs the BridgeJob controller

use clap::{Parser, Subcommand};
use kube::Client;

use bridge_common::telemetry::{init_telemetry, TelemetryConfig};
use bridge_operator::controller_runner::build_job_controller;
use bridge_operator::crds::{crd_yaml, ensure_crds};

/// Bridge - runs jobs on external schedulers as Kubernetes resources
#[derive(Parser, Debug)]
#[command(name = "bridge-operator", version, about, long_about = None)]
struct Cli {
    /// Print the BridgeJob CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the BridgeJob controller (default mode)
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crd_yaml()?);
        return Ok(());
    }

    let mut telemetry = init_telemetry(TelemetryConfig::for_service("bridge-operator"))?;
    let result = match cli.command {
        Some(Commands::Controller) | None => run_controller().await,
    };
    telemetry.shutdown();
    result
}

/// Install the CRD and run the controller until a shutdown signal arrives
async fn run_controller() -> anyhow::Result<()> {
    tracing::info!("Bridge controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds(&client).await?;

    tracing::info!("Starting controllers:");
    build_job_controller(client).await;

    tracing::info!("Bridge controller shutting down");
    Ok(())
}
