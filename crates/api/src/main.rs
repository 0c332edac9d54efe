//! Sensor Monitor - Main Entry Point

use anyhow::{bail, Context};
use api::{init_logging, AppConfig, Lifecycle, ShutdownReason};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("loading configuration")?;
    init_logging(config.effective_log_level(), config.log_format)?;

    info!("=== Sensor Monitor v{} ===", env!("CARGO_PKG_VERSION"));
    info!(
        "MQTT broker {}:{} topic {}, database {}",
        config.mqtt_broker,
        config.mqtt_port,
        config.mqtt_topic,
        config.db_path.display()
    );

    let mut lifecycle = Lifecycle::start(config)
        .await
        .context("starting sensor monitor")?;
    let served = lifecycle.serve().await;
    let outcome = lifecycle.shutdown().await;
    info!("Subscriber stop outcome: {:?}", outcome);

    match served.context("query service failed")? {
        ShutdownReason::IngestFault(fault) => bail!("stopped after ingest fault: {}", fault),
        reason => info!("Stopped ({})", reason),
    }
    Ok(())
}
