//! Modbus gateway for Zenoh.
//!
//! Polls Modbus devices (TCP, RTU/serial or simulated) and publishes their
//! state to Zenoh, writing registers back on command.

use anyhow::{Context, Result};
use tracing::info;

use modbus_gw::{Gateway, GatewayConfig, build_transports};
use modbus_gw_framework::{BridgeArgs, BridgeRunner};

#[tokio::main]
async fn main() -> Result<()> {
    let args = BridgeArgs::parse_with_default("gateway.json5");

    let mut config = GatewayConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    if let Some(uid) = &args.uid {
        config.gateway.uid = Some(uid.clone());
    }

    let mut runner = BridgeRunner::new_with_args("modbus-gw", config.clone(), Some(&args))
        .await
        .context("Failed to start bridge runner")?
        .with_status();
    info!(config = ?args.config, "Loaded configuration");

    let gateway = Gateway::new(&config, runner.bus(), build_transports(&config))
        .context("Failed to build gateway")?;
    gateway.start().await.context("Failed to start gateway")?;

    let metadata = serde_json::json!({
        "uid": gateway.uid(),
        "buses": config.buses.iter().map(|b| &b.name).collect::<Vec<_>>(),
        "devices": gateway.devices().iter().map(|d| d.name()).collect::<Vec<_>>(),
    });

    runner.on_shutdown(async move {
        gateway.shutdown().await;
    });

    runner.run_with_metadata(Some(metadata)).await?;
    info!("Modbus gateway stopped");

    Ok(())
}
