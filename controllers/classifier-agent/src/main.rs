//! Classifier Agent binary

use classifier_agent::config::AgentConfig;
use classifier_agent::{Controller, ControllerError};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Only one crypto provider is compiled in; install it before the kube client needs TLS
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        info!("rustls crypto provider already installed");
    }

    info!("Starting Classifier Agent");

    let config = AgentConfig::from_env()?;
    info!("Configuration:");
    info!("  Cluster: {}/{} ({})", config.cluster_namespace, config.cluster_name, config.cluster_type);
    info!("  Discovery interval: {:?}", config.discovery_interval);
    info!("  Dry run: {}", config.dry_run);
    info!("  Metrics address: {}", config.metrics_addr);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
