//! # spindrift
//!
//! Peer-to-peer folder synchronization daemon.
//!
//! ## Commands
//!
//! - `init`: write a default configuration file
//! - `serve`: run the daemon
//! - `check-config`: parse and echo the configuration
//!
//! ## Example
//!
//! ```bash
//! spindrift init --config spindrift.toml
//! spindrift serve --config spindrift.toml
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use spindrift_daemon::{config::Config, supervisor};

#[derive(Parser)]
#[command(name = "spindrift", version, about = "peer-to-peer folder synchronization")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "spindrift.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default configuration file.
    Init,
    /// Run the synchronization daemon.
    Serve,
    /// Parse the configuration and print the normalized form.
    CheckConfig,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Init => {
            if cli.config.exists() {
                bail!("{} already exists", cli.config.display());
            }
            let config = Config::default();
            std::fs::write(&cli.config, config.to_toml()?)
                .with_context(|| format!("writing {}", cli.config.display()))?;
            println!("wrote {}", cli.config.display());
            Ok(())
        }
        Command::Serve => {
            let config = Config::from_file(&cli.config)?;
            supervisor::run(config).await
        }
        Command::CheckConfig => {
            let config = Config::from_file(&cli.config)?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}
