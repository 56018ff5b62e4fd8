//! ScreenLink agent entry point.
//!
//! Wires together the network observer, connection manager, adaptive
//! quality task, and streaming pipeline, then runs the Tokio async event
//! loop.
//!
//! # Usage
//!
//! ```text
//! screenlink-agent [OPTIONS]
//!
//! Options:
//!   --relay-url   <URL>    Relay WebSocket URL (overrides agent.toml)
//!   --device-name <NAME>   Device name reported on authentication
//!   --token       <TOKEN>  Provisioning token for first enrollment
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable                | Description                               |
//! |-------------------------|-------------------------------------------|
//! | `SCREENLINK_RELAY_URL`  | Relay WebSocket URL                       |
//! | `SCREENLINK_TOKEN`      | Provisioning token for first enrollment   |
//! | `RUST_LOG`              | Log filter (wins over the config file)    |
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load_config() / load_credentials()   -- TOML config, stored token
//!  └─ spawn_network_observer()             -- debounce + stability watch
//!  └─ spawn_connection_manager()           -- WebSocket session lifecycle
//!  └─ spawn_quality_task()                 -- health -> quality profile
//!  └─ spawn_frame_transmitter()            -- queue -> live session
//!  └─ StreamScreenUseCase::run()           -- capture -> queue
//!  └─ passthrough dispatch loop            -- RouteInputUseCase
//! ```
//!
//! # Platform seams
//!
//! Three adapters here are stand-ins. In a production kiosk image:
//! - the network reporter is replaced by a netlink watcher that feeds real
//!   OS connectivity events into the observer;
//! - `SyntheticFrameSource` is replaced by a platform screen encoder;
//! - `LoggingInputSink` is replaced by an input injector (uinput on Linux).

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use screenlink_agent::application::route_input::{LoggingInputSink, RouteInputUseCase};
use screenlink_agent::application::stream_screen::{StreamScreenUseCase, SyntheticFrameSource};
use screenlink_agent::infrastructure::network::connection_manager::{
    spawn_connection_manager, ConnectionManagerConfig, NullDeviceProbe,
};
use screenlink_agent::infrastructure::network::observer::spawn_network_observer;
use screenlink_agent::infrastructure::network::WsRelayTransport;
use screenlink_agent::infrastructure::storage::config::{load_config, AgentConfig};
use screenlink_agent::infrastructure::storage::token::load_credentials;
use screenlink_agent::infrastructure::streaming::{
    shared_frame_queue, spawn_frame_transmitter, spawn_quality_task,
};
use screenlink_core::{DisconnectReason, NetworkStatus, QualityConfig, TransportKind};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// ScreenLink kiosk agent.
///
/// Maintains a long-lived WebSocket connection to the ScreenLink relay and
/// streams the kiosk screen with adaptive quality. CLI arguments override
/// the config file; environment variables fill in when arguments are
/// absent.
#[derive(Debug, Parser)]
#[command(
    name = "screenlink-agent",
    about = "ScreenLink kiosk agent — adaptive screen streaming over a relay",
    version
)]
struct Cli {
    /// Relay WebSocket URL, e.g. `wss://relay.example.net/device`.
    #[arg(long, env = "SCREENLINK_RELAY_URL")]
    relay_url: Option<String>,

    /// Device name reported during authentication.
    #[arg(long)]
    device_name: Option<String>,

    /// Provisioning token used for first enrollment when no stored
    /// credential exists. Ignored once the device has enrolled.
    #[arg(long, env = "SCREENLINK_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

impl Cli {
    /// Applies CLI overrides on top of the loaded config file.
    fn apply_to(&self, config: &mut AgentConfig) {
        if let Some(url) = &self.relay_url {
            config.relay.url = url.clone();
        }
        if let Some(name) = &self.device_name {
            config.agent.device_name = name.clone();
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = load_config()?;
    cli.apply_to(&mut config);

    // Initialise structured logging. RUST_LOG wins over the config file.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.agent.log_level.clone())),
        )
        .init();

    info!(device_name = %config.agent.device_name, relay = %config.relay.url, "ScreenLink agent starting");

    // ── Credentials ───────────────────────────────────────────────────────────
    // A stored credential means the device has enrolled before; otherwise
    // the provisioning token enrolls a fresh device id.
    let (device_id, token) = match load_credentials()? {
        Some(creds) => (creds.device_id, creds.token),
        None => {
            let token = cli.token.clone().unwrap_or_default();
            if token.is_empty() {
                warn!("no stored credentials and no provisioning token; relay will reject us");
            }
            (Uuid::new_v4(), token)
        }
    };

    // ── Network observer ──────────────────────────────────────────────────────
    let observer = spawn_network_observer(config.network.to_stability_config());

    // In production: a netlink watcher owns this reporter. Here we report a
    // single "online" event so the stability window can elapse.
    let reporter = observer.reporter();
    tokio::spawn(async move {
        let status = NetworkStatus {
            is_available: true,
            is_validated: true,
            is_metered: false,
            transport: TransportKind::Ethernet,
            signal_strength: None,
            observed_at: tokio::time::Instant::now().into_std(),
        };
        let _ = reporter.send(status).await;
    });

    // ── Connection manager ────────────────────────────────────────────────────
    let manager_config = ConnectionManagerConfig {
        relay_url: config.relay.url.clone(),
        device_id,
        device_name: Some(config.agent.device_name.clone()),
        os_version: Some(std::env::consts::OS.to_string()),
        connect_timeout: config.connect_timeout(),
        cadence: config.heartbeat.to_cadence_config(),
        backoff: config.reconnect.to_backoff_config(),
        circuit: config.reconnect.to_circuit_config(),
        health: config.health_config(),
        ..ConnectionManagerConfig::default()
    };

    let mut manager = spawn_connection_manager(
        manager_config,
        Arc::new(WsRelayTransport),
        Arc::new(NullDeviceProbe),
        observer.is_stable.clone(),
    );
    manager.connect(token).await;

    // ── Streaming pipeline ────────────────────────────────────────────────────
    let queue = shared_frame_queue(config.streaming.queue_capacity);

    let (profile_rx, _quality_join) = spawn_quality_task(
        QualityConfig::default(),
        config.streaming.initial_quality_level(),
        manager.health.clone(),
    );

    let _transmitter_join =
        spawn_frame_transmitter(Arc::clone(&queue), manager.outbound(), profile_rx);

    // In production: replace SyntheticFrameSource with the platform screen
    // encoder for the compile target.
    let capture = StreamScreenUseCase::new(Arc::clone(&queue), manager.outbound());
    tokio::spawn(async move {
        if let Err(e) = capture.run(SyntheticFrameSource::new(30, 16 * 1024)).await {
            warn!("capture loop stopped: {e}");
        }
    });

    // ── Ctrl-C handler ────────────────────────────────────────────────────────
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(()).await;
        }
    });

    // ── Passthrough dispatch loop ─────────────────────────────────────────────
    let mut route_input = RouteInputUseCase::new(LoggingInputSink);

    info!("ScreenLink agent ready");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,

            passthrough = manager.passthrough.recv() => {
                let Some((kind, payload)) = passthrough else { break };
                if let Err(e) = route_input.route(&kind, payload).await {
                    warn!("input routing error: {e}");
                }
            }
        }
    }

    manager.disconnect(DisconnectReason::Shutdown).await;
    manager.shutdown().await;
    observer.shutdown();
    info!("ScreenLink agent stopped");
    Ok(())
}
