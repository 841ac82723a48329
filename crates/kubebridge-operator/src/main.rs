//! kubebridge - mirrors custom resources into the internal store

use std::sync::Arc;

use clap::Parser;

use kubebridge_common::telemetry::init_tracing;
use kubebridge_datasource::MemoryStore;
use kubebridge_operator::{provide_registry, BridgeConfig, BridgeService};

/// kubebridge - reconcile custom resources into the internal store
#[derive(Parser, Debug)]
#[command(name = "kubebridge", version, about, long_about = None)]
struct Cli {
    /// Print the CRD manifests of every registered kind and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    config: BridgeConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let registry = provide_registry(Arc::new(MemoryStore::new()))?;

    if cli.crd {
        for crd in registry.crds() {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    init_tracing(cli.config.log_format)?;

    let service = BridgeService::start(&cli.config, &registry).await?;
    tracing::info!(
        controllers = service.controller_count(),
        "kubebridge running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!(
        grace_secs = service.shutdown_grace().as_secs(),
        "Shutdown signal received"
    );
    service.stop_gracefully().await;

    Ok(())
}
