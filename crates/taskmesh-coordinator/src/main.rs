//! TaskMesh coordinator daemon.

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use taskmesh_coordinator::{run_daemon, Config};

/// TaskMesh coordinator instance.
#[derive(Parser, Debug)]
#[command(name = "taskmesh-coordinator", about = "TaskMesh coordinator instance")]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Instance id (overrides config and TASKMESH_INSTANCE_ID)
    #[arg(long)]
    instance_id: Option<String>,

    /// Shared state directory (overrides config and TASKMESH_STATE_DIR)
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// HTTP status address, e.g. 127.0.0.1:9464
    #[arg(long)]
    http_addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("taskmesh=info")),
        )
        .with_target(true)
        .init();

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(id) = args.instance_id {
        config.instance_id = id;
    }
    if let Some(dir) = args.state_dir {
        config.state_dir = dir;
    }
    if args.http_addr.is_some() {
        config.http_addr = args.http_addr;
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down");
                signal.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl+C"),
        }
    });

    run_daemon(config, shutdown).await?;
    Ok(())
}
