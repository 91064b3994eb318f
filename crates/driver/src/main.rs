//! wixusb-host
//!
//! Host daemon of the WixUSB bridge. Binds matching USB functions to device
//! minors, keeps the registry in step with hot-plug events and publishes each
//! minor as a socket node other processes can open.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use common::{
    WatcherBridge, WatcherCommand, WatcherEvent, create_watcher_bridge, resolve_log_level,
    setup_logging,
};
use driver::config::HostConfig;
use driver::usb::{DeviceWatcher, spawn_watcher};
use driver::{DeviceRegistry, NodeServer, OpenFile};
use protocol::{
    Channel, DescriptorPacket, DescriptorType, DeviceDescriptor, Opcode, VidPidPacket, WirePacket,
};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "wixusb-host")]
#[command(
    author,
    version,
    about = "WixUSB host - bind USB functions and publish them as WinUSB-style nodes"
)]
#[command(long_about = "
Host side of the WixUSB bridge. Watches for USB functions matching the
configured vendor/product table and exposes each one as a device minor.
While running, minor N is published as a Unix socket at <node_prefix>N
that wixusb-cli opens like a device node.

EXAMPLES:
    # Watch for devices until Ctrl+C
    wixusb-host run

    # List matching devices and exit
    wixusb-host list

    # Bind every matching device once and query it through the channel
    wixusb-host check

    # Run with debug logging
    wixusb-host --log-level debug run

CONFIGURATION:
    The host looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/wixusb/host.toml
    3. /etc/wixusb/host.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch for devices until Ctrl+C (default)
    Run,
    /// List matching devices and exit
    List,
    /// Bind matching devices and query ids and device descriptor
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = HostConfig::default();
        let path = HostConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        driver::config::load_config(path).context("Failed to load configuration")?
    } else {
        HostConfig::load_or_default()
    };

    let log_level = resolve_log_level(args.log_level.as_deref(), &config.host.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("wixusb-host v{}", env!("CARGO_PKG_VERSION"));
    info!("Protocol version: {}", protocol::PROTOCOL_VERSION);

    let registry = Arc::new(DeviceRegistry::new(config.usb.max_minors));
    let ids = config.id_table()?;
    let watcher = DeviceWatcher::new(registry.clone(), ids, config.usb.interface)
        .context("Failed to initialize USB context")?;

    match args.command.unwrap_or(Command::Run) {
        Command::Check => check(watcher, &registry),
        Command::List => {
            let (bridge, worker) = create_watcher_bridge();
            let handle = spawn_watcher(watcher, worker).context("Failed to spawn USB watcher")?;
            let result = list_devices(&bridge).await;
            shutdown(bridge, handle).await;
            result
        }
        Command::Run => {
            let (bridge, worker) = create_watcher_bridge();
            let handle = spawn_watcher(watcher, worker).context("Failed to spawn USB watcher")?;
            let mut nodes = NodeServer::new(registry.clone(), config.host.node_prefix.clone());
            let result = run(&bridge, &mut nodes).await;
            shutdown(bridge, handle).await;
            nodes.shutdown();
            registry.shutdown();
            result
        }
    }
}

/// Print matching devices
async fn list_devices(bridge: &WatcherBridge) -> Result<()> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    bridge
        .send_command(WatcherCommand::ListDevices { response: tx })
        .await
        .context("Failed to send ListDevices command")?;

    let devices = rx.await.context("Failed to receive device list")?;

    if devices.is_empty() {
        println!("No matching USB devices found.");
    } else {
        println!("Found {} matching device(s):\n", devices.len());
        for device in devices {
            println!("  {}", device);
        }
    }
    Ok(())
}

/// Publish and withdraw nodes as devices come and go, until Ctrl+C
async fn run(bridge: &WatcherBridge, nodes: &mut NodeServer) -> Result<()> {
    info!("Press Ctrl+C to shutdown");

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                break;
            }
            event = bridge.recv_event() => match event {
                Ok(WatcherEvent::Attached { minor, device }) => match nodes.publish(minor) {
                    Ok(path) => info!("{} -> {}", device, path.display()),
                    Err(e) => error!("{}: could not publish minor {}: {}", device, minor, e),
                },
                Ok(WatcherEvent::Detached { minor, device }) => {
                    nodes.withdraw(minor);
                    info!("{} left (minor {} withdrawn)", device, minor);
                }
                Ok(WatcherEvent::AttachFailed { device, reason }) => {
                    warn!("Could not bind {}: {}", device, reason);
                }
                Err(e) => {
                    return Err(anyhow!("USB watcher stopped: {}", e));
                }
            }
        }
    }

    let (tx, rx) = tokio::sync::oneshot::channel();
    if bridge
        .send_command(WatcherCommand::ListSessions { response: tx })
        .await
        .is_ok()
    {
        if let Ok(sessions) = rx.await {
            info!("{} session(s) open at shutdown", sessions.len());
        }
    }
    Ok(())
}

/// Stop the watcher thread and wait for it
///
/// The bridge stays open until the thread exits so its final detach events
/// still have a receiver.
async fn shutdown(
    bridge: WatcherBridge,
    handle: std::thread::JoinHandle<std::result::Result<(), rusb::Error>>,
) {
    info!("Shutting down USB subsystem...");
    if let Err(e) = bridge.send_command(WatcherCommand::Shutdown).await {
        error!("Error shutting down USB watcher: {:#}", e);
    }

    match tokio::task::spawn_blocking(move || handle.join()).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!("USB watcher failed: {}", e),
        Ok(Err(e)) => error!("USB watcher thread panicked: {:?}", e),
        Err(e) => error!("Failed to join USB watcher: {}", e),
    }
}

/// Bind every matching device once and query it through the channel
fn check(mut watcher: DeviceWatcher, registry: &DeviceRegistry) -> Result<()> {
    let events = watcher.enumerate().context("Failed to enumerate devices")?;
    if events.is_empty() {
        println!("No matching USB devices found.");
        return Ok(());
    }

    for event in &events {
        match event {
            WatcherEvent::Attached { minor, device } => {
                println!("{} -> minor {}", device, minor);
                if let Err(e) = check_minor(registry, *minor) {
                    println!("  check failed: {:#}", e);
                }
            }
            WatcherEvent::AttachFailed { device, reason } => {
                println!("{}: not bound ({})", device, reason);
            }
            WatcherEvent::Detached { .. } => {}
        }
    }

    watcher.shutdown();
    Ok(())
}

fn check_minor(registry: &DeviceRegistry, minor: u32) -> Result<()> {
    let mut file = OpenFile::open(registry, minor)?;

    let mut ids = [0u8; VidPidPacket::SIZE];
    file.ioctl(Opcode::GetVendorProductId.request_code(), &mut ids)
        .context("GetVendorProductId failed")?;
    let ids = VidPidPacket::decode(&ids)?;
    println!("  ids: {:04x}:{:04x}", ids.vendor_id, ids.product_id);

    let mut packet = DescriptorPacket::new(DescriptorType::Device as u8, 0).to_bytes();
    let len = file
        .ioctl(Opcode::GetDescriptor.request_code(), &mut packet)
        .context("GetDescriptor failed")?;
    let raw = DescriptorPacket::reply_data(&packet, usize::try_from(len)?)?;
    let descriptor = DeviceDescriptor::parse(raw)?;
    println!(
        "  device: USB {:x}.{:02x}, class {:02x}, ep0 {} bytes, {} configuration(s)",
        descriptor.bcd_usb >> 8,
        descriptor.bcd_usb & 0xff,
        descriptor.device_class,
        descriptor.max_packet_size0,
        descriptor.num_configurations
    );

    file.release();
    Ok(())
}
