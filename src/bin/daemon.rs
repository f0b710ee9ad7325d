//! usbdb Daemon Binary
//!
//! Runs the manager and its reconciliation loop against the host's USB drives.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};
use usbdb::{Config, Manager, SystemVolumeControl};

/// usbdb Daemon
#[derive(Parser, Debug)]
#[command(name = "usbdb-daemon")]
#[command(about = "Keeps USB drives attached to a non-redundant file store")]
#[command(version)]
struct Args {
    /// Config file with `key: value` overrides
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Root directory for mount points and the overflow store
    #[arg(short, long)]
    root_dir: Option<PathBuf>,

    /// Directory for the status snapshot
    #[arg(short, long)]
    info_dir: Option<PathBuf>,

    /// Directory for helper scripts
    #[arg(short, long)]
    scripts_dir: Option<PathBuf>,

    /// Maximum number of attached drives
    #[arg(short = 'n', long)]
    max_volumes: Option<usize>,

    /// Writer threads per drive
    #[arg(short = 'w', long)]
    max_writers: Option<usize>,

    /// Sleep between chunk writes in milliseconds
    #[arg(long)]
    write_rate_ms: Option<u64>,

    /// Run mount/umount/df without sudo
    #[arg(long)]
    no_sudo: bool,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,usbdb=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    tracing::info!("usbdb daemon v{}", usbdb::VERSION);
    tracing::info!("Root directory: {}", config.root_dir.display());
    tracing::info!("Status file: {}", config.status_path().display());

    let control = Arc::new(SystemVolumeControl::from_config(&config));
    let manager = Arc::new(Manager::with_status_file(config, control));

    if let Err(e) = manager.init() {
        tracing::error!("Failed to initialize manager: {}", e);
        std::process::exit(1);
    }

    tracing::info!(
        "Manager initialized with {} drive(s): {:?}",
        manager.active_volume_count(),
        manager.usb_drive_names()
    );

    let reconciler = match manager.start_reconciler() {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("Failed to start reconciliation loop: {}", e);
            std::process::exit(1);
        }
    };

    // The loop runs until the process is killed
    reconciler.wait();
    tracing::info!("Daemon stopped");
}

fn build_config(args: &Args) -> usbdb::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_kv_file(path)?,
        None => Config::default(),
    };

    if let Some(dir) = &args.root_dir {
        config.root_dir = dir.clone();
    }
    if let Some(dir) = &args.info_dir {
        config.info_dir = dir.clone();
    }
    if let Some(dir) = &args.scripts_dir {
        config.scripts_dir = dir.clone();
    }
    if let Some(n) = args.max_volumes {
        config.max_volumes = n;
    }
    if let Some(n) = args.max_writers {
        config.max_writers = n;
    }
    if let Some(ms) = args.write_rate_ms {
        config.write_rate_ms = ms;
    }
    if args.no_sudo {
        config.use_sudo = false;
    }

    config.validate()?;
    Ok(config)
}
