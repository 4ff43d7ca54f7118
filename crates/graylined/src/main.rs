//! graylined — the Grayline daemon.
//!
//! Single binary that assembles all Grayline subsystems:
//! - State store (redb)
//! - Rollout coordinator + execution pool
//! - Health monitor (Prometheus queries)
//! - Rollback policy engine
//! - REST API
//!
//! # Usage
//!
//! ```text
//! graylined serve --config /etc/grayline/grayline.toml --port 8640
//! graylined print-config > grayline.toml
//! ```

mod daemon;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use grayline_core::GraylineConfig;
use grayline_state::StateStore;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::daemon::Daemon;

const DEFAULT_LOG_FILTER: &str = "info,grayline=debug,graylined=debug";

#[derive(Parser)]
#[command(name = "graylined", about = "Grayline gray release daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinator, health monitor and API server.
    Serve {
        /// Path to grayline.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides the config file).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides the config file).
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Print the default configuration as TOML.
    PrintConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
        } => {
            let mut config = match config {
                Some(path) => GraylineConfig::from_file(&path)?,
                None => GraylineConfig::default(),
            };
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.server.data_dir = data_dir;
            }
            config.validate()?;
            serve(config).await
        }
        Command::PrintConfig => {
            print!("{}", GraylineConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn serve(config: GraylineConfig) -> anyhow::Result<()> {
    info!("Grayline daemon starting");

    // Ensure data directory exists.
    std::fs::create_dir_all(&config.server.data_dir)?;
    let db_path = config.server.data_dir.join("grayline.redb");

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let daemon = Daemon::assemble(&config, store).await?;
    info!(
        prometheus = %config.prometheus.address,
        interval = %config.health.interval,
        max_concurrent = config.rollout.max_concurrent_executions,
        "subsystems initialized"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let events_handle = tokio::spawn(daemon.clone().run_events(shutdown_rx));

    // ── Start API server ───────────────────────────────────────

    let router = grayline_api::build_router(daemon.coordinator.clone(), daemon.monitor.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    let _ = events_handle.await;
    daemon.monitor.stop_all().await;

    info!("Grayline daemon stopped");
    Ok(())
}
