//! usbdb CLI
//!
//! One-shot commands against a usbdb installation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};
use usbdb::{Config, KvFile, Manager, SystemVolumeControl, VolumeControl};

/// usbdb CLI
#[derive(Parser, Debug)]
#[command(name = "usbdb-cli")]
#[command(about = "CLI for the usbdb file store")]
struct Args {
    /// Config file with `key: value` overrides
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the status snapshot written by the daemon
    Status,

    /// List attached USB devices
    Devices,

    /// Store one file
    Put {
        /// File to store
        file: PathBuf,

        /// Name to store it under (defaults to the file name)
        #[arg(short, long)]
        name: Option<String>,

        /// Fall back to the overflow store if no drive can take it
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::from_kv_file(path),
        None => Ok(Config::default()),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    };

    let result = match args.command {
        Commands::Status => status(&config),
        Commands::Devices => devices(&config),
        Commands::Put { file, name, force } => put(config, &file, name, force),
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn status(config: &Config) -> usbdb::Result<()> {
    let mut file = KvFile::open(config.status_path());
    file.load()?;
    for (key, value) in file.entries() {
        println!("{}: {}", key, value);
    }
    Ok(())
}

fn devices(config: &Config) -> usbdb::Result<()> {
    let control = SystemVolumeControl::from_config(config);
    control.prepare()?;
    for device in control.list_attached_devices() {
        let mounted = device
            .mounted_on
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}\t{} bytes\t{}% used\t{}",
            device.device, device.total_bytes, device.used_percent, mounted
        );
    }
    Ok(())
}

fn put(config: Config, file: &Path, name: Option<String>, force: bool) -> usbdb::Result<()> {
    let name = match name {
        Some(name) => name,
        None => file
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| usbdb::UsbDbError::InvalidName(file.display().to_string()))?,
    };
    let data = std::fs::read(file)?;

    let control = Arc::new(SystemVolumeControl::from_config(&config));
    let manager = Manager::with_status_file(config, control);
    manager.init()?;

    if !manager.save(data, &name, force) {
        manager.uninit();
        println!("{}: not saved", name);
        return Ok(());
    }

    while manager.is_currently_writing(&name) {
        thread::sleep(Duration::from_millis(100));
    }

    let stored = manager.is_written_to_db(&name);
    manager.uninit();
    println!("{}: {}", name, if stored { "saved" } else { "write failed" });
    Ok(())
}
