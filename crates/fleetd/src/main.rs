//! fleetd — the FleetGrid daemon.
//!
//! Single binary that assembles all FleetGrid subsystems:
//! - State store (redb)
//! - Event bus + change-notification coalescer
//! - Rollout executor
//! - REST API
//!
//! # Usage
//!
//! ```text
//! fleetd standalone --config /etc/fleetgrid/fleet.toml --port 8480
//! fleetd config --config /etc/fleetgrid/fleet.toml
//! ```

mod standalone;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use fleet_core::config::FleetConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fleetd", about = "FleetGrid daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every subsystem in one process.
    Standalone {
        /// Path to fleet.toml; built-in defaults when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides `api.port`).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides `store.data_dir`).
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Print the effective configuration as TOML.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Standalone {
            config,
            port,
            data_dir,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(port) = port {
                config.api.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.store.data_dir = data_dir;
            }
            standalone::run_standalone(config).await
        }
        Command::Config { config } => {
            print!("{}", load_config(config.as_deref())?.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fleetd=debug,fleetgrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<FleetConfig> {
    match path {
        Some(path) => FleetConfig::from_file(path),
        None => Ok(FleetConfig::default()),
    }
}
