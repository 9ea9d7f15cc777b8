//! OTA upload tool
//!
//! Scans for OTA receivers and streams a signed firmware image to one of them.

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::LevelFilter;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ota_ble_controller::ble::{self, BleTransport};
use ota_ble_controller::{UploadConfig, UploadJob, Uploader};
use ota_proto::ble::DEFAULT_DEVICE_NAME;

#[derive(Parser)]
#[command(name = "ota-ble")]
#[command(about = "Upload signed firmware to OTA receivers over BLE")]
struct Cli {
    /// Log level: off, error, warn, info, debug or trace
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for BLE devices
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Name substring marking OTA receivers
        #[arg(short, long, default_value = DEFAULT_DEVICE_NAME)]
        name: String,
    },
    /// Upload a firmware image and its signature bundle
    Upload {
        /// Firmware binary
        #[arg(short, long)]
        firmware: PathBuf,
        /// Signature bundle (JSON with index, sj, cj, eMj)
        #[arg(short, long)]
        signature: PathBuf,
        /// JSON upload configuration, flags below override it
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Substring of the advertised device name
        #[arg(short, long)]
        device: Option<String>,
        /// CHUNK payload size in bytes
        #[arg(long)]
        chunk_size: Option<usize>,
        /// Seconds to look for the device
        #[arg(long)]
        scan_timeout: Option<u64>,
        /// Give up on a single write after this many milliseconds
        #[arg(long)]
        write_timeout_ms: Option<u64>,
        /// Whole-session attempts before giving up
        #[arg(long)]
        attempts: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    env_logger::Builder::from_default_env()
        .filter_level(parse_log_level(&cli.log_level))
        .format_timestamp_millis()
        .init();

    match cli.command {
        Commands::Scan { duration, name } => {
            scan_devices(duration, &name).await?;
        }
        Commands::Upload {
            firmware,
            signature,
            config,
            device,
            chunk_size,
            scan_timeout,
            write_timeout_ms,
            attempts,
        } => {
            let mut upload_config = match config {
                Some(path) => UploadConfig::load(path)?,
                None => UploadConfig::default(),
            };
            if let Some(device) = device {
                upload_config.device_name = device;
            }
            if let Some(chunk_size) = chunk_size {
                upload_config.chunk_size = chunk_size;
            }
            if let Some(secs) = scan_timeout {
                upload_config.scan_timeout_secs = secs;
            }
            if write_timeout_ms.is_some() {
                upload_config.write_timeout_ms = write_timeout_ms;
            }
            if let Some(attempts) = attempts {
                upload_config.attempts = attempts;
            }
            upload_firmware(upload_config, &firmware, &signature).await?;
        }
    }

    Ok(())
}

async fn scan_devices(duration: u64, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    println!("Scanning for BLE devices ({} seconds)...", duration);

    let devices = ble::scan(Duration::from_secs(duration), name).await?;

    println!("\nFound {} devices:", devices.len());
    for device in devices {
        let rssi = device.rssi.map(|r| format!("{} dBm", r)).unwrap_or_else(|| "N/A".to_string());
        let marker = if device.matches { " [OTA]" } else { "" };
        println!("  {} ({}) RSSI: {}{}", device.name, device.address, rssi, marker);
    }

    Ok(())
}

async fn upload_firmware(
    config: UploadConfig,
    firmware: &Path,
    signature: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    let job = UploadJob::load(firmware, signature)?;
    log::info!(
        "firmware {}: {} bytes, signature index {}, eMj {} bytes",
        firmware.display(),
        job.image.len(),
        job.bundle.index,
        job.bundle.emj.len()
    );

    let transport = BleTransport::new(config.characteristic).await?;

    let bar = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::with_template("[{bar:40}] {pos}/{len} frames {msg}") {
        bar.set_style(style.progress_chars("=> "));
    }
    let progress = bar.clone();
    let mut uploader = Uploader::new(transport, config).on_progress(move |p| {
        progress.set_length(p.total_frames as u64);
        progress.set_position(p.frames_sent as u64);
        progress.set_message(p.phase.to_string());
    });

    let cancel = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => log::warn!("interrupted, stopping upload"),
            Err(e) => {
                log::warn!("cannot listen for Ctrl-C: {e}");
                std::future::pending::<()>().await
            }
        }
    };

    let result = uploader.upload_until(&job, cancel).await;
    match &result {
        Ok(_) => bar.finish_with_message("done"),
        Err(_) => bar.abandon(),
    }
    let report = result?;

    println!(
        "Firmware upload complete: {} frames ({} signature chunks, {} firmware chunks), {} bytes in {:.1?}",
        report.frames_sent,
        report.signature_chunks,
        report.firmware_chunks,
        report.bytes_sent,
        report.elapsed
    );
    println!("The device verifies the image and reboots on its own.");
    Ok(())
}

/// Map `--log-level` to a filter
fn parse_log_level(level: &str) -> LevelFilter {
    match level.to_uppercase().as_str() {
        "OFF" => LevelFilter::Off,
        "ERROR" => LevelFilter::Error,
        "WARN" => LevelFilter::Warn,
        "INFO" => LevelFilter::Info,
        "DEBUG" => LevelFilter::Debug,
        "TRACE" => LevelFilter::Trace,
        _ => {
            eprintln!("Unknown log level: {}. Using INFO", level);
            LevelFilter::Info
        }
    }
}
