//! gantryd - control-plane daemon for SPI-attached motion firmware.
//!
//! # Configuration
//!
//! Configuration merges in layers, lowest priority first:
//!
//! 1. Compiled-in defaults
//! 2. Config file (`--config`, default `/etc/gantry/gantry.toml`)
//! 3. Environment variables (`GANTRY_*`)
//! 4. CLI arguments (highest priority)
//!
//! # Exit Codes
//!
//! - `0`: normal shutdown (SIGINT/SIGTERM)
//! - `1`: fatal SPI link loss after retries exhausted
//! - `2`: startup configuration error

mod spidev_link;

use clap::Parser;
use gantry_runtime::{Daemon, GantryConfig};
use gantry_types::{DaemonError, ErrorCode};
use spidev_link::{
    SpidevLink, DEFAULT_DIRECTION_GPIO, DEFAULT_PARTNER_GPIO, DEFAULT_READY_GPIO,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Control-plane daemon for SPI-attached motion firmware.
#[derive(Parser, Debug)]
#[command(name = "gantryd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// SPI device node (overrides config)
    #[arg(long)]
    device: Option<PathBuf>,

    /// Macro directory (overrides config)
    #[arg(long)]
    macro_dir: Option<PathBuf>,

    /// SBC-ready GPIO number
    #[arg(long, default_value_t = DEFAULT_READY_GPIO)]
    ready_gpio: u32,

    /// Firmware-ready GPIO number
    #[arg(long, default_value_t = DEFAULT_PARTNER_GPIO)]
    partner_gpio: u32,

    /// Transfer-direction GPIO number
    #[arg(long, default_value_t = DEFAULT_DIRECTION_GPIO)]
    direction_gpio: u32,
}

const DEFAULT_CONFIG_PATH: &str = "/etc/gantry/gantry.toml";

fn resolve_config(args: &Args) -> Result<GantryConfig, gantry_runtime::ConfigError> {
    // An explicitly named file must exist; the default path is optional.
    let path = match &args.config {
        Some(path) => Some(path.clone()),
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            default.exists().then(|| default.to_path_buf())
        }
    };
    let mut config = GantryConfig::load(path.as_deref())?;

    // CLI overrides are the highest-priority layer.
    if args.debug {
        config.debug = true;
    }
    if let Some(device) = &args.device {
        config.spi.device = device.clone();
    }
    if let Some(macro_dir) = &args.macro_dir {
        config.paths.macro_dir = macro_dir.clone();
    }
    Ok(config)
}

fn init_tracing(debug: bool) {
    let default_filter = if debug { "gantry=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_env("GANTRY_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match resolve_config(&args) {
        Ok(config) => config,
        Err(err) => {
            // Tracing is not up yet; startup errors go to stderr.
            eprintln!("gantryd: {err} [{}]", err.code());
            return ExitCode::from(2);
        }
    };
    init_tracing(config.debug);

    let link = match SpidevLink::open(
        &config.spi.device,
        args.ready_gpio,
        args.partner_gpio,
        args.direction_gpio,
    ) {
        Ok(link) => link,
        Err(err) => {
            error!(device = %config.spi.device.display(), %err, "cannot open SPI device");
            return ExitCode::from(2);
        }
    };

    let mut daemon = Daemon::new(config);
    let shutdown = daemon.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            shutdown.cancel();
        }
    });

    match daemon.run(link).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err @ DaemonError::LinkFailure(_)) => {
            error!(%err, "SPI link lost");
            ExitCode::from(1)
        }
        Err(err) => {
            error!(%err, "unexpected daemon failure");
            ExitCode::from(2)
        }
    }
}
