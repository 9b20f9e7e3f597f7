//! LoRa gateway bridge - serial/MQTT coordination daemon
//!
//! Bridges a point-to-point LoRa radio link (AT commands over a local
//! serial port) and a remote MQTT broker. The cloud enrolls the gateway,
//! manages downstream nodes and actuates their relays; the bridge polls
//! every enrolled node for sensor readings in between.
//!
//! Module structure:
//! - `domain/` - Wire codec and canonical data types
//! - `io/` - External interfaces (serial transport, MQTT link)
//! - `services/` - Coordination logic (arbiter, poller, dispatcher, controllers)
//! - `infra/` - Infrastructure (config, persistent stores)

use clap::Parser;
use lora_gateway_bridge::infra::{Config, GatewayStore, NodeStore};
use lora_gateway_bridge::io::{start_mqtt_link, SerialLink, TelemetrySink};
use lora_gateway_bridge::services::{
    Arbiter, CommandDispatcher, GatewayController, NodeController, NodePoller,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// LoRa gateway bridge - radio link to MQTT coordination daemon
#[derive(Parser, Debug)]
#[command(name = "lora-gateway-bridge", version, about)]
struct Args {
    /// Override the GATEWAY_ID environment variable
    #[arg(long)]
    gateway_id: Option<String>,

    /// Override the SERIAL_PORT environment variable
    #[arg(long)]
    serial_port: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    // Default: INFO, use RUST_LOG=debug for full event visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "lora_gateway_bridge_starting");

    // Parse command line arguments using clap
    let args = Args::parse();

    // Load configuration from the environment, CLI flags win
    let config = Config::from_env()
        .with_gateway_id(args.gateway_id)
        .with_serial_port(args.serial_port);

    info!(
        gateway_id = %config.gateway_id(),
        serial_port = %config.serial_port(),
        serial_baudrate = %config.serial_baudrate(),
        mqtt_broker = %config.mqtt_broker(),
        mqtt_port = %config.mqtt_port(),
        mqtt_client_id = %config.mqtt_client_id(),
        mqtt_tls = config.mqtt_tls_enabled(),
        "config_loaded"
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Persistent state and the serial arbiter
    let gateway_store = Arc::new(GatewayStore::load(config.gateway_status_file()));
    let node_store = Arc::new(NodeStore::load(config.node_list_file(), config.gateway_id()));
    let arbiter = Arc::new(Arbiter::new());
    let link = SerialLink::new(config.serial_port(), config.serial_baudrate());

    // Command channel (bounded; commands are not durably queued)
    let (command_tx, command_rx) = mpsc::channel(64);

    // Start the MQTT link (event loop task handles reconnection)
    let mqtt = start_mqtt_link(&config, command_tx, shutdown_rx.clone());

    // Controllers
    let gateway = Arc::new(GatewayController::new(&config, gateway_store.clone(), mqtt.clone()));
    let nodes = Arc::new(NodeController::new(
        &config,
        arbiter.clone(),
        link.clone(),
        node_store.clone(),
        gateway_store.clone(),
    ));

    let status = gateway.status();
    info!(
        is_enrolled = %gateway_store.is_enrolled(),
        enrolled_nodes = node_store.all().len(),
        status = %serde_json::to_string(&status).unwrap_or_default(),
        "gateway_state_loaded"
    );

    // Start the command dispatcher
    let dispatcher =
        CommandDispatcher::new(arbiter.clone(), gateway.clone(), nodes.clone(), mqtt.clone());
    let dispatcher_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        dispatcher.run(command_rx, dispatcher_shutdown).await;
    });

    // Start the node poller
    let telemetry: Arc<dyn TelemetrySink> = mqtt.clone();
    let poller = NodePoller::new(
        &config,
        arbiter.clone(),
        link,
        node_store.clone(),
        gateway_store.clone(),
        telemetry,
    );
    let poller_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        poller.run(poller_shutdown).await;
    });

    // Run until Ctrl+C, then shut down cleanly: retained disconnected
    // status out first, then stop the tasks (permits and ports release as
    // the poller and dispatcher unwind).
    tokio::signal::ctrl_c().await.ok();
    info!("shutdown_signal_received");

    if mqtt.is_connected() {
        mqtt.publish_status("disconnected").await;
    }
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(Duration::from_millis(200)).await;

    info!("lora-gateway-bridge shutdown complete");
    Ok(())
}
