use std::sync::Arc;

use anyhow::Context;
use beacon_server::registry::EurekaRegistry;
use beacon_server::token::JwksTokenVerifier;
use beacon_server::{Config, ServerError, shutdown, telemetry};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let config = Config::from_env().context("invalid configuration")?;
    info!(
        app = %config.app_name,
        environment = %config.environment,
        registration = config.registry.enabled,
        "starting"
    );

    let metrics = telemetry::install_metrics()?;
    let registry = Arc::new(EurekaRegistry::new(&config.registry)?);
    let verifier = Arc::new(JwksTokenVerifier::new(&config.token).map_err(ServerError::TokenVerifier)?);

    let server = beacon_server::start(&config, registry, verifier, Some(metrics)).await?;
    server.run_until(shutdown::shutdown_signal()).await?;
    Ok(())
}
