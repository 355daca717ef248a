//! Tessera service instance bootstrapper.
//!
//! Boots one instance from configuration, waits for a termination signal,
//! then tears the exchange down in order: pipelines, dispatcher, broker.

use std::time::Duration;

use tessera_core::auditing;
use tessera_core::config::Config;
use tessera_core::instance::{InstanceRole, ServiceInstance};
use tessera_core::shutdown::GracefulShutdown;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    auditing::initialize(&config.auditing);

    let instance = ServiceInstance::new(config, InstanceRole::Full);
    instance.start().await?;

    let shutdown = GracefulShutdown::new();
    let signal = shutdown.wait().await;
    tracing::info!(%signal, "termination signal received");

    instance.stop(SHUTDOWN_TIMEOUT).await;
    Ok(())
}
