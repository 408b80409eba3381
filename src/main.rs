//! # Credential Broker Main Entry Point

use credbroker::{config::ConfigLoader, server::run_server, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from layered env files and variables.
    let config = ConfigLoader::new().load()?;

    telemetry::init_tracing(&config);

    tracing::info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        tracing::debug!(config = %redacted_json, "Effective configuration");
    }

    run_server(config).await
}
