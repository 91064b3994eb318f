//! wixusb-cli
//!
//! Command-line front end for the WinUSB facade: connect to the first WixUSB
//! node and issue one call.

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use client::config::{self, ClientConfig};
use client::{DevNode, DevNodeOpener, WinUsbDevice};
use common::{resolve_log_level, setup_logging};
use protocol::SetupPacket;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "wixusb-cli")]
#[command(author, version, about = "WixUSB client - WinUSB calls from the command line")]
#[command(long_about = "
Issues WinUSB-style calls against a WixUSB device node. A node is either a
character device created by the kernel driver or a socket published by
`wixusb-host run`; both are opened the same way.

EXAMPLES:
    # Show ids and the device descriptor
    wixusb-cli info

    # Fetch the configuration descriptor
    wixusb-cli descriptor --type 2

    # Vendor IN request, 8 bytes
    wixusb-cli control --request-type 0xc0 --request 1 --length 8

    # Bulk round trip with a 500 ms timeout
    wixusb-cli --timeout 500 write deadbeef
    wixusb-cli --timeout 500 read 64

CONFIGURATION:
    The client looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/wixusb/client.toml
    3. /etc/wixusb/client.toml
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

    /// Transfer timeout in milliseconds applied before the call
    #[arg(short, long, value_name = "MS")]
    timeout: Option<u32>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show node, ids, connectivity and device descriptor (default)
    Info,
    /// Fetch a descriptor and dump it
    Descriptor {
        #[arg(long = "type", value_parser = parse_u8, default_value = "1")]
        descriptor_type: u8,
        #[arg(long, value_parser = parse_u8, default_value = "0")]
        index: u8,
        #[arg(long, value_parser = parse_u16, default_value = "0")]
        language: u16,
    },
    /// Control transfer; direction follows bit 7 of the request type
    Control {
        #[arg(long, value_parser = parse_u8)]
        request_type: u8,
        #[arg(long, value_parser = parse_u8)]
        request: u8,
        #[arg(long, value_parser = parse_u16, default_value = "0")]
        value: u16,
        #[arg(long, value_parser = parse_u16, default_value = "0")]
        index: u16,
        /// IN: bytes to request
        #[arg(long, default_value_t = 0)]
        length: u16,
        /// OUT: payload as hex
        #[arg(long)]
        data: Option<String>,
    },
    /// Bulk IN
    Read { length: usize },
    /// Bulk OUT of a hex payload
    Write { data: String },
    /// Interrupt OUT of a hex payload
    Interrupt { data: String },
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = ClientConfig::default();
        let path = ClientConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        config::load_config(path).context("Failed to load configuration")?
    } else {
        ClientConfig::load_or_default()
    };

    let log_level = resolve_log_level(args.log_level.as_deref(), &config.client.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    let mut device: WinUsbDevice<DevNode> = WinUsbDevice::connect(
        &DevNodeOpener,
        &config.client.node_prefix,
        config.client.candidates,
    )
    .map_err(|errno| {
        anyhow!(
            "No WixUSB device under {}0..{} ({})",
            config.client.node_prefix,
            config.client.candidates,
            errno
        )
    })?;
    info!("Using {}", device.path().display());

    if let Some(ms) = args.timeout {
        if !device.set_timeout(ms) {
            return Err(failure(&device, "SetPipePolicy"));
        }
    }

    match args.command.unwrap_or(Command::Info) {
        Command::Info => show_info(&mut device),
        Command::Descriptor {
            descriptor_type,
            index,
            language,
        } => {
            let mut buf = [0u8; protocol::DESC_BUFF_LENGTH];
            let len = device
                .get_descriptor(descriptor_type, index, language, &mut buf)
                .with_context(|| format!("GetDescriptor({:#04x}, {}) failed", descriptor_type, index))?;
            println!("{}", hex_dump(&buf[..len]));
            Ok(())
        }
        Command::Control {
            request_type,
            request,
            value,
            index,
            length,
            data,
        } => {
            let mut buf = match data {
                Some(hex) => parse_hex(&hex)?,
                None => vec![0u8; usize::from(length)],
            };
            let setup = SetupPacket {
                request_type,
                request,
                value,
                index,
                length: u16::try_from(buf.len()).context("Payload too long")?,
            };
            let mut transferred = 0;
            if !device.control_transfer(setup, &mut buf, Some(&mut transferred)) {
                return Err(failure(&device, "ControlTransfer"));
            }
            println!("{} byte(s)", transferred);
            if setup.request_type & 0x80 != 0 {
                println!("{}", hex_dump(&buf[..transferred]));
            }
            Ok(())
        }
        Command::Read { length } => {
            let mut buf = vec![0u8; length];
            let mut transferred = 0;
            if !device.read_pipe(0x82, &mut buf, Some(&mut transferred)) {
                return Err(failure(&device, "ReadPipe"));
            }
            println!("{}", hex_dump(&buf[..transferred]));
            Ok(())
        }
        Command::Write { data } => {
            let payload = parse_hex(&data)?;
            let mut transferred = 0;
            if !device.write_pipe(0x03, &payload, Some(&mut transferred)) {
                return Err(failure(&device, "WritePipe"));
            }
            println!("{} byte(s) written", transferred);
            Ok(())
        }
        Command::Interrupt { data } => {
            let payload = parse_hex(&data)?;
            if !device.write_interrupt(&payload) {
                return Err(failure(&device, "WriteInterrupt"));
            }
            println!("{} byte(s) written", payload.len());
            Ok(())
        }
    }
}

fn show_info(device: &mut WinUsbDevice<DevNode>) -> Result<()> {
    let ids = device
        .vendor_product_id()
        .context("GetVendorProductId failed")?;
    println!("Node:      {}", device.path().display());
    println!("ID:        {:04x}:{:04x}", ids.vendor_id, ids.product_id);
    println!("Connected: {}", device.check_connected());

    let descriptor = device
        .device_descriptor()
        .context("Device descriptor unavailable")?;
    println!(
        "USB:       {:x}.{:02x}",
        descriptor.bcd_usb >> 8,
        descriptor.bcd_usb & 0xff
    );
    println!(
        "Class:     {:02x}/{:02x}/{:02x}",
        descriptor.device_class, descriptor.device_subclass, descriptor.device_protocol
    );
    println!("EP0:       {} bytes", descriptor.max_packet_size0);
    println!("Configs:   {}", descriptor.num_configurations);
    Ok(())
}

fn failure(device: &WinUsbDevice<DevNode>, call: &str) -> anyhow::Error {
    match device.last_error() {
        Some(e) => anyhow!("{} failed: {} ({})", call, e, e.errno()),
        None => anyhow!("{} failed", call),
    }
}

fn parse_u8(s: &str) -> Result<u8, String> {
    parse_u16(s).and_then(|v| u8::try_from(v).map_err(|e| e.to_string()))
}

fn parse_u16(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("'{}': {}", s, e))
}

fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let s: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if !s.is_ascii() {
        return Err(anyhow!("Hex payload contains non-ASCII characters"));
    }
    if s.len() % 2 != 0 {
        return Err(anyhow!("Hex payload has an odd number of digits"));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .with_context(|| format!("Invalid hex byte '{}'", &s[i..i + 2]))
        })
        .collect()
}

fn hex_dump(data: &[u8]) -> String {
    data.chunks(16)
        .enumerate()
        .map(|(row, chunk)| {
            let bytes: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
            format!("{:04x}: {}", row * 16, bytes.join(" "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}
