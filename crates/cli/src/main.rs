//! uac-stream CLI
//!
//! Captures isochronous audio from a pre-opened USB Audio Class device
//! and writes the raw byte stream to a file. The device file descriptor
//! must be opened by the caller (udev rule, fd passing, or similar);
//! this tool performs no enumeration of its own.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use uac_stream::{AudioSink, DeviceHandoff, SinkError, StreamConfig, UacSession, setup_logging};

#[derive(Parser, Debug)]
#[command(name = "uac-stream")]
#[command(
    author,
    version,
    about = "Capture isochronous audio from a USB Audio Class device"
)]
#[command(long_about = "
Streams audio from a UAC capture device into a raw PCM file.

The device must already be open: pass the usbfs file descriptor together
with the vendor/product ids and bus/device numbers it belongs to.

EXAMPLES:
    # Capture 5 seconds from fd 7
    uac-stream --vendor-id 0x046d --product-id 0x0a38 --fd 7 \\
        --bus 1 --device 4 --output capture.raw

    # Custom stream geometry
    uac-stream --config stream.toml --vendor-id 0x046d --product-id 0x0a38 \\
        --fd 7 --bus 1 --device 4 --output capture.raw
")]
struct Args {
    /// Expected vendor id (hex with 0x prefix or decimal)
    #[arg(long, value_parser = parse_u16)]
    vendor_id: u16,

    /// Expected product id (hex with 0x prefix or decimal)
    #[arg(long, value_parser = parse_u16)]
    product_id: u16,

    /// Already-open usbfs file descriptor for the device
    #[arg(long)]
    fd: i32,

    /// Bus number the descriptor belongs to
    #[arg(long)]
    bus: u8,

    /// Device number on that bus
    #[arg(long)]
    device: u8,

    /// Raw PCM output file
    #[arg(short, long, value_name = "PATH")]
    output: PathBuf,

    /// Capture duration in seconds
    #[arg(long, default_value_t = 5)]
    duration: u64,

    /// Path to a stream configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn parse_u16(s: &str) -> Result<u16, String> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|e| format!("invalid id '{}': {}", s, e))
}

/// Sink that appends every forwarded transfer to a file.
struct FileSink {
    writer: Mutex<BufWriter<File>>,
}

impl FileSink {
    fn create(path: &PathBuf) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create output file {}", path.display()))?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl AudioSink for FileSink {
    fn write(&self, payload: &[u8]) -> Result<(), SinkError> {
        let mut writer = self.writer.lock().map_err(|e| SinkError(e.to_string()))?;
        writer
            .write_all(payload)
            .map_err(|e| SinkError(e.to_string()))
    }

    fn detach(&self) {
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writer.flush();
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level).context("Failed to initialize logging")?;

    let config = match &args.config {
        Some(path) => StreamConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => StreamConfig::default(),
    };

    let sink = FileSink::create(&args.output)?;
    let mut session =
        UacSession::new(config, Box::new(sink)).context("Failed to create session")?;

    let handoff = DeviceHandoff {
        vendor_id: args.vendor_id,
        product_id: args.product_id,
        fd: args.fd,
        bus: args.bus,
        device: args.device,
    };
    session.open(&handoff).context("Failed to open device")?;

    let pump = session
        .event_pump()
        .context("Failed to create event pump")?
        .spawn();

    let submitted = session.start().context("Failed to start capture")?;
    info!("capturing with {} transfers in flight", submitted);

    std::thread::sleep(Duration::from_secs(args.duration));

    session.stop();
    let total_bytes = session.measure();
    session.close().context("Failed to close device")?;

    pump.join()
        .map_err(|_| anyhow::anyhow!("USB event pump thread panicked"))?;

    println!(
        "captured {} bytes to {} in {} s",
        total_bytes,
        args.output.display(),
        args.duration
    );
    Ok(())
}
