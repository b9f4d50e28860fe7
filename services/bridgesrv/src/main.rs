//! GridLink Device Bridge service

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use bridgesrv::bus::{MemoryBus, MessageBus, MqttBus};
use bridgesrv::core::bootstrap::{self, Args};
use bridgesrv::core::config::{AppConfig, BusKind};
use bridgesrv::protocols::create_default_registry;
use bridgesrv::runtime::BridgeService;
use bridgesrv::storage::NullSink;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_default_config {
        print!("{}", bootstrap::default_config_yaml()?);
        return Ok(());
    }

    let config = AppConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    let _log_guard = common::init_logging(&args.log_options(&config.logging))?;
    info!(
        "{} v{} starting",
        config.service.name,
        env!("CARGO_PKG_VERSION")
    );

    // Validation mode: validate and exit
    if args.validate {
        bootstrap::validate_devices(&config, &create_default_registry())?;
        info!("Validation completed successfully");
        return Ok(());
    }

    let bus: Arc<dyn MessageBus> = match config.bus.kind {
        BusKind::Memory => Arc::new(MemoryBus::new()),
        BusKind::Mqtt => Arc::new(MqttBus::start(&config.bus.mqtt)),
    };

    let service = BridgeService::start(&config, Arc::clone(&bus), Arc::new(NullSink)).await?;

    let token = CancellationToken::new();
    let listener = common::cancel_on_shutdown(token.clone());
    token.cancelled().await;
    common::join_listener(listener).await;

    info!("Shutting down");
    service.shutdown().await;
    if let Err(e) = bus.close().await {
        error!("Bus close err: {}", e);
    }
    info!("{} stopped", config.service.name);
    Ok(())
}
