use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gatekeeper::admission::{spawn_counter_sweeper, Admission};
use gatekeeper::config::AdmissionConfig;
use gatekeeper::http::HttpServer;
use gatekeeper::ratelimit::{MemoryCounterStore, SystemClock};

/// Admission control service: per-client rate limiting and upstream throttling.
#[derive(Parser, Debug)]
#[command(name = "gatekeeper", version)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the HTTP listen address
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Gatekeeper Admission Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = AdmissionConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.server.http_addr = addr;
    }
    info!(http_addr = %config.server.http_addr, "Configuration loaded");

    // Counters live in process memory and reset on restart.
    let clock = Arc::new(SystemClock);
    let store = Arc::new(MemoryCounterStore::new(clock.clone()));
    let sweeper = spawn_counter_sweeper(store.clone(), config.rate_limiting.sweep_interval());

    let admission = Arc::new(Admission::from_config(&config, store, clock));
    info!("Admission control initialized");

    let server = HttpServer::new(config.server.http_addr, admission.clone());
    server.serve_with_shutdown(shutdown_signal()).await?;

    admission.shutdown();
    sweeper.abort();

    info!("Gatekeeper Admission Service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
