//! CanBadger probe simulator
//!
//! # Usage
//!
//! ```bash
//! ./canbadger-sim --bind 0.0.0.0
//! ./canbadger-sim --config config/canbadger-sim.toml
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use canbadger_sim::{ProbeSimulator, SimConfig};
use clap::Parser;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "canbadger-sim")]
#[command(about = "Simulated CanBadger probe for client development")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind the command socket to
    #[arg(short, long)]
    bind: Option<String>,

    /// Command port (0 picks a free port)
    #[arg(short, long)]
    port: Option<u16>,

    /// NACK every UDS session start and hijack
    #[arg(long)]
    reject_uds: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        "canbadger_sim=debug"
    } else {
        "canbadger_sim=info"
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &args.config {
        Some(path) => {
            info!("Loading config from: {}", path.display());
            SimConfig::load(path).context("Failed to load config")?
        }
        None => SimConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(port) = args.port {
        config.command_port = port;
    }
    if args.reject_uds {
        config.uds.accept_sessions = false;
    }

    let simulator = ProbeSimulator::bind(config).await?;
    info!(addr = %simulator.local_addr()?, "Waiting for clients, Ctrl-C to exit");

    simulator
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;
    Ok(())
}
