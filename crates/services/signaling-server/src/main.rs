//! Signaling server binary entry point
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (WebSocket on 0.0.0.0:8080, HTTP on 0.0.0.0:8081)
//! cargo run -p roomcast-signaling-server
//!
//! # Load a config file and override the room limit
//! cargo run -p roomcast-signaling-server -- --config signaling.toml --max-room-members 4
//!
//! # JSON logs with debug output
//! RUST_LOG=debug SIGNALING_LOG_JSON=true cargo run -p roomcast-signaling-server
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use roomcast_signaling::{LivenessMonitor, SignalingHub, WebSocketSignalingServer};
use roomcast_signaling_server::api::{build_router, AppState};
use roomcast_signaling_server::config::ServiceConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Room signaling relay for peer-to-peer video calls
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "SIGNALING_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind both listeners to
    #[arg(long)]
    host: Option<String>,

    /// WebSocket signaling port
    #[arg(long)]
    ws_port: Option<u16>,

    /// HTTP status API port
    #[arg(long)]
    http_port: Option<u16>,

    /// Maximum members per room
    #[arg(long)]
    max_room_members: Option<usize>,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,
}

impl Args {
    fn apply(&self, config: &mut ServiceConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.ws_port {
            config.server.ws_port = port;
        }
        if let Some(port) = self.http_port {
            config.server.http_port = port;
        }
        if let Some(max) = self.max_room_members {
            config.relay.max_room_members = max;
        }
        if self.json_logs {
            config.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ServiceConfig::load(args.config.as_ref())?;
    args.apply(&mut config);
    config.validate()?;

    init_tracing(config.logging.json);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        ws_port = config.server.ws_port,
        http_port = config.server.http_port,
        max_room_members = config.relay.max_room_members,
        default_room = %config.relay.default_room,
        "Starting signaling server"
    );

    let hub = Arc::new(SignalingHub::new(config.relay.clone())?);

    // Create shutdown signal channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Background liveness sweeps
    let monitor = Arc::new(LivenessMonitor::new(Arc::clone(&hub)));
    let sweep_handles = monitor.spawn(&shutdown_tx);

    // WebSocket signaling listener
    let ws_server = WebSocketSignalingServer::new(config.server.ws_addr()?, Arc::clone(&hub));
    let ws_handle = ws_server
        .start()
        .await
        .context("failed to start WebSocket listener")?;

    // HTTP status API
    let router = build_router(AppState::new(Arc::clone(&hub)));
    let http_addr = config.server.http_addr()?;
    let listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {}", http_addr))?;
    tracing::info!("HTTP status API listening on http://{}", http_addr);

    // Run the HTTP server with graceful shutdown on SIGTERM/SIGINT
    let shutdown_tx_clone = shutdown_tx.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, initiating graceful shutdown...");
            let _ = shutdown_tx_clone.send(());
        })
        .await?;

    // Signal shutdown to all background tasks
    let _ = shutdown_tx.send(());
    ws_handle.shutdown().await;
    for handle in sweep_handles {
        let _ = handle.await;
    }

    tracing::info!("Signaling server shutdown complete");
    Ok(())
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
