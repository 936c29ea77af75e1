//! usb-link
//!
//! Command-line front end: lists devices, watches for attach/detach, and
//! sends to, receives from or describes a device picked by vendor and
//! product id.

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use common::{DeviceIdentity, create_event_bridge, setup_logging};
use link::config::{self, LinkConfig};
use link::usb::{LinkService, RusbHost};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "usb-link")]
#[command(author, version, about = "Talk to USB peripherals over bulk endpoints")]
#[command(long_about = "
Negotiates access to a USB device, resolves its bulk endpoints, decodes its
descriptors and exchanges data with it.

EXAMPLES:
    # List attached devices
    usb-link list

    # Print device and configuration descriptors
    usb-link describe --device 1234:5678

    # Send a payload and read the reply
    usb-link exchange --device 1234:5678 \"ping\"

    # Follow attach/detach events
    usb-link watch

CONFIGURATION:
    usb-link looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-link/link.toml
    3. /etc/usb-link/link.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached USB devices
    List,
    /// Print attach/detach events until Ctrl+C
    Watch,
    /// Fetch and decode device and configuration descriptors
    Describe {
        /// Device as VID:PID in hex, e.g. 1234:5678
        #[arg(short, long, value_parser = parse_device)]
        device: (u16, u16),
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Send a payload to the first bulk OUT endpoint
    Send {
        #[arg(short, long, value_parser = parse_device)]
        device: (u16, u16),
        payload: String,
    },
    /// Read from the first bulk IN endpoint
    Receive {
        #[arg(short, long, value_parser = parse_device)]
        device: (u16, u16),
        /// Maximum bytes to read (defaults to the configured buffer size)
        #[arg(long)]
        max_bytes: Option<usize>,
    },
    /// Send a payload, then read the reply
    Exchange {
        #[arg(short, long, value_parser = parse_device)]
        device: (u16, u16),
        payload: String,
        #[arg(long)]
        max_bytes: Option<usize>,
    },
}

/// Parse `VID:PID`, hex with or without a `0x` prefix
fn parse_device(s: &str) -> std::result::Result<(u16, u16), String> {
    let (vid, pid) = s
        .split_once(':')
        .ok_or_else(|| format!("expected VID:PID, got '{}'", s))?;
    let hex = |part: &str| {
        let digits = part.trim_start_matches("0x").trim_start_matches("0X");
        u16::from_str_radix(digits, 16).map_err(|_| format!("'{}' is not a 16-bit hex id", part))
    };
    Ok((hex(vid)?, hex(pid)?))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = LinkConfig::default();
        let path = LinkConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        config::load_config(path).context("Failed to load configuration")?
    } else {
        LinkConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.general.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-link v{}", env!("CARGO_PKG_VERSION"));

    let (events, receiver) = create_event_bridge();
    let host = Arc::new(
        RusbHost::new(events.clone(), config.usb.skip_root_hubs)
            .context("Failed to initialize libusb")?,
    );
    let service = Arc::new(LinkService::new(host, &config, events));
    let event_loop = service
        .spawn_event_loop(receiver)
        .context("Failed to start event loop")?;

    let result = run(args.command.unwrap_or(Command::List), service.clone()).await;

    info!("Shutting down...");
    let shutdown = service.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || shutdown.shutdown()).await {
        error!("Shutdown task failed: {}", e);
    }
    if let Err(e) = event_loop.join() {
        error!("Event loop thread panicked: {:?}", e);
    }

    result
}

async fn run(command: Command, service: Arc<LinkService>) -> Result<()> {
    match command {
        Command::List => list_devices(service).await,
        Command::Watch => watch(service).await,
        Command::Describe { device, json } => {
            let description = blocking(service, device, |s, d| s.describe(d)).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&description)?);
            } else {
                println!("{}", description);
            }
            Ok(())
        }
        Command::Send { device, payload } => {
            let sent = blocking(service, device, move |s, d| s.send(d, payload.as_bytes())).await?;
            println!("Sent {} bytes", sent);
            Ok(())
        }
        Command::Receive { device, max_bytes } => {
            let data = blocking(service, device, move |s, d| s.receive(d, max_bytes)).await?;
            print_received(&data);
            Ok(())
        }
        Command::Exchange {
            device,
            payload,
            max_bytes,
        } => {
            let data = blocking(service, device, move |s, d| {
                s.exchange(d, payload.as_bytes(), max_bytes)
            })
            .await?;
            print_received(&data);
            Ok(())
        }
    }
}

/// Resolve the device and run a blocking service operation off the runtime
async fn blocking<T, F>(service: Arc<LinkService>, (vid, pid): (u16, u16), op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&LinkService, &DeviceIdentity) -> common::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let device = service.find_device(vid, pid)?;
        info!("Using {}", device);
        op(&service, &device).map_err(|e| anyhow!("{}: {}", device, e))
    })
    .await
    .context("Worker task failed")?
}

fn print_received(data: &[u8]) {
    println!("Received {} bytes", data.len());
    println!("{}", String::from_utf8_lossy(data));
}

async fn list_devices(service: Arc<LinkService>) -> Result<()> {
    let devices = tokio::task::spawn_blocking(move || service.list())
        .await
        .context("Worker task failed")??;

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        let identity = &device.identity;
        println!(
            "  [{}] {:04x}:{:04x} - {}",
            identity.device_id.0, identity.vendor_id, identity.product_id, identity.display_name
        );
        for interface in &device.interfaces {
            println!("{}", interface);
        }
        println!();
    }
    Ok(())
}

async fn watch(service: Arc<LinkService>) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    let watcher = service
        .spawn_watcher(stop.clone())
        .context("Failed to start enumeration watcher")?;

    println!("Watching for USB devices, press Ctrl+C to stop");
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, stopping watcher"),
        Err(e) => error!("Error waiting for Ctrl+C: {}", e),
    }

    stop.store(true, Ordering::SeqCst);
    tokio::task::spawn_blocking(move || watcher.join())
        .await
        .context("Worker task failed")?
        .map_err(|e| anyhow!("Watcher thread panicked: {:?}", e))
}
