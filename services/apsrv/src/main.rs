//! # AP Supervisory Service - Main Entry Point
//!
//! Loads the configuration, brings up logging, constructs the monitor
//! engine and the DCS module, then parks the main thread on the halt
//! condition until a component asks for shutdown (in replay mode, when the
//! samples run out).
//!
//! ```bash
//! # Start with default configuration
//! cargo run --bin apsrv
//!
//! # Start with a custom configuration file
//! cargo run --bin apsrv -- --config /etc/apsrv.yaml
//!
//! # Raise the log level
//! RUST_LOG=debug cargo run --bin apsrv
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use apsrv::core::dcs::Dcs;
use apsrv::core::monitor::MonitorEngine;
use apsrv::utils::shutdown::Halt;

/// Command line arguments for the AP supervisory service
#[derive(Parser)]
#[command(
    name = "apsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Supervisory agent for Wi-Fi HaLow access point radios"
)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/apsrv.yaml")]
    config: PathBuf,

    /// Log directory path; console-only when omitted
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Override log level (debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = apsrv::config::load_config(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    common::logging::init_with_config(common::logging::LogConfig {
        service_name: "apsrv".to_string(),
        log_dir: args.log_dir,
        default_level: args.log_level.parse().unwrap_or(tracing::Level::INFO),
    })
    .context("initialising logging")?;

    info!("Initialising...");

    let halt = Halt::new();
    let engine = MonitorEngine::new();

    let dcs = Dcs::create(&config, &engine, halt.clone()).context("initialising DCS")?;

    engine.start().context("starting monitor engine")?;

    // Suspend until a component signals that the service should stop
    halt.wait();

    info!("Shutting down");
    drop(dcs);
    engine.stop().context("stopping monitor engine")?;

    Ok(())
}
