//! Icemux CLI: run the connection front-end stand-alone.
//!
//! ```bash
//! icemux serve --config icemux.toml
//! ```
//!
//! Without a media backend attached the front-end accepts, filters and
//! routes clients, answering every mount with a polite refusal; wire a real
//! `Dispatch` implementation to put streams behind it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use icemux_core::handlers::DefaultDispatch;
use icemux_core::{ConfigStore, Frontend, IcemuxConfig};

#[derive(Parser)]
#[command(
    name = "icemux",
    about = "Streaming media connection front-end",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept connections until SIGINT/SIGTERM; SIGHUP reloads the config
    Serve {
        /// Path to the TOML configuration
        #[arg(long, default_value = "icemux.toml")]
        config: PathBuf,
    },
    /// Parse and validate a configuration file, then exit
    Check {
        /// Path to the TOML configuration
        #[arg(long, default_value = "icemux.toml")]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve { config } => serve(config),
        Commands::Check { config } => check(config),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn serve(config_path: PathBuf) -> Result<()> {
    let store = ConfigStore::from_file(config_path)?;
    icemux_core::logging::init(&store.snapshot().logging)?;

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async {
        let frontend = Frontend::new(store, Arc::new(DefaultDispatch))?;
        frontend.run().await
    })
}

fn check(config_path: PathBuf) -> Result<()> {
    let config = IcemuxConfig::load(&config_path)?;
    println!(
        "{}: ok ({} listener{}, client limit {})",
        config_path.display(),
        config.listeners.len(),
        if config.listeners.len() == 1 { "" } else { "s" },
        config.client_limit
    );
    Ok(())
}
