//! Gem server (v1)
//!
//! Serves a minimal application plus the built-in lifecycle routes, and
//! survives restarts without closing its listening sockets.
//!
//! # Architecture Overview
//!
//! ```text
//!        SIGHUP                                    SIGTERM
//!          │                                          │
//!          ▼                                          ▼
//!  ┌───────────────┐  spawn, fds 3..3+N   ┌────────────────────┐
//!  │ parent (gen n)│─────────────────────▶│ child (gen n+1)    │
//!  │               │  GEM_GRACEFUL_RESTART│                    │
//!  │  restart      │  GEM_SERVER_ADDRS    │ inherit listeners  │
//!  │  coordinator  │◀─────────────────────│ serve              │
//!  │               │  readiness byte      │ notify parent      │
//!  └──────┬────────┘  on fd 3+N           └────────────────────┘
//!         │
//!         ▼
//!  drain: stop keep-alive → wait in-flight ≤ wait timeout → close → exit
//! ```

use std::path::PathBuf;

use axum::{routing::get, Router};
use clap::Parser;

use gem::config::{load_config, GemConfig};
use gem::lifecycle::handshake::split_addrs;
use gem::net::tls::tls_for;
use gem::observability::{logging, metrics};
use gem::Server;

#[derive(Parser)]
#[command(name = "gem")]
#[command(about = "HTTP server with zero-downtime restarts", long_about = None)]
struct Cli {
    /// Path to gem.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Comma-separated listen addresses, overriding the config file
    #[arg(short, long)]
    addrs: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => GemConfig::default(),
    };
    if let Some(addrs) = &cli.addrs {
        config.server.addrs = split_addrs(addrs);
    }

    logging::init_logging(&config.observability);
    tracing::info!(name = gem::NAME, version = gem::VERSION, "gem starting");

    tracing::info!(
        addrs = ?config.server.addrs,
        wait_timeout_secs = config.server.wait_timeout_secs,
        readiness_grace_ms = config.lifecycle.readiness_grace_ms,
        "Configuration loaded"
    );

    let app = Router::new().route("/", get(|| async { "Hello from gem\n" }));

    let mut server = Server::new(&config.server.addrs, app);
    server.configure(&config)?;
    server.set_tls(tls_for(&config.server).await?);
    server.set_metrics_handle(metrics::install_recorder());

    server.run().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
