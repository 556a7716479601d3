#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # deskrelay
//!
//! Remote-desktop tunnel relay in front of guacd.
//!
//! A browser opens a WebSocket, the relay opens a TCP connection to guacd,
//! performs the Guacamole handshake and then copies instructions in both
//! directions. Other browsers may attach read-only to a live session.
//!
//! ## Subcommands
//!
//! - `deskrelay serve` (default) — run the HTTP/WS server
//! - `deskrelay check-config` — load and validate the configuration, then exit
//!
//! ## API surface
//!
//! | Method | Path                                          | Description                         |
//! |--------|-----------------------------------------------|-------------------------------------|
//! | GET    | `/api/health`                                 | Liveness probe                      |
//! | POST   | `/api/tunnels`                                | Create a tunnel for an asset        |
//! | GET    | `/api/tunnels/{id}`                           | Session record                      |
//! | GET    | `/api/tunnels/{id}/ws`                        | Primary relay (WebSocket)           |
//! | GET    | `/api/sessions`                               | Live sessions                       |
//! | DELETE | `/api/sessions/{id}`                          | Force close a session               |
//! | GET    | `/api/sessions/{id}/observe`                  | Observer relay (WebSocket)          |
//! | DELETE | `/api/sessions/{id}/observers/{observer_id}`  | Kick one observer                   |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, sweep task, graceful shutdown
//! config.rs        — TOML + env-var configuration
//! assets.rs        — configured remote targets
//! records.rs       — session records and their lifecycle
//! guac/
//!   instruction.rs — instruction codec and frame reader
//!   config.rs      — connection parameters and client capabilities
//!   tunnel.rs      — guacd connection and handshake
//! sessions/
//!   session.rs     — Session, Observer, close signals
//!   mod.rs         — SessionManager registry
//! relay/
//!   pump.rs        — per-direction relay loops
//!   handler.rs     — Relay orchestration
//! routes/          — REST handlers
//! ws/              — WebSocket upgrades and socket adapters
//! ```

use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};

use deskrelay::assets::AssetCatalog;
use deskrelay::{routes, AppState, Config};

/// Remote-desktop tunnel relay in front of guacd.
#[derive(Parser)]
#[command(name = "deskrelay", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Validate the configuration and print a summary.
    CheckConfig {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::CheckConfig { config }) => check_config(config.as_deref()),
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    }
}

fn check_config(config_path: Option<&str>) {
    let config = Config::load(config_path);
    println!("listen:     {}", config.server.listen);
    println!("guacd:      {}", config.guacd.address);
    println!(
        "recording:  {}",
        if config.recording.enabled {
            config.recording.path.as_str()
        } else {
            "disabled"
        }
    );
    let assets = AssetCatalog::new(config.assets.iter().cloned());
    println!("assets:     {}", assets.len());
    for asset in assets.list() {
        println!(
            "  {:<16} {:<10} {}:{}{}",
            asset.id,
            asset.protocol,
            asset.hostname,
            asset.port(),
            if asset.active { "" } else { " (inactive)" }
        );
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("deskrelay v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    info!("guacd at {}", config.guacd.address);
    if config.recording.enabled {
        info!("Session recording to {}", config.recording.path);
    }

    let state = AppState::new(config);
    if state.relay.assets().is_empty() {
        warn!("No assets configured; every tunnel request will fail");
    }
    let app = routes::router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Periodic sweep: prune closed and abandoned session records
    let records = state.relay.records().clone();
    let server_config = state.config.server.clone();
    let sweep_task = tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(server_config.sweep_interval_secs.max(1)));
        loop {
            interval.tick().await;
            records
                .sweep(
                    server_config.record_retention_ms(),
                    server_config.pending_ttl_ms(),
                )
                .await;
        }
    });

    // Graceful shutdown: close live sessions so clients get a disconnect
    let relay = state.relay.clone();
    let shutdown = async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
        relay.shutdown().await;
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Shutting down...");
    sweep_task.abort();
    info!("Goodbye");
}
