//! `dcam` command line tool.
//!
//! ```bash
//! dcam list
//! dcam props 0 --json
//! dcam capture 0 --frames 20 --buffers 4 --exposure 0.005
//! dcam --config bench.toml capture 1 --mode snap --preset focus-sweep
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dcam_control::config::DEFAULT_CONFIG_FILE;
use dcam_control::logging::init_tracing;
use dcam_control::{
    CancelToken, CaptureMode, Dcam, DcamError, Preset, PropertyId, SessionHandle, Settings,
};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "dcam")]
#[command(version, about = "Camera session, property and acquisition control", long_about = None)]
struct Cli {
    /// Config file path
    #[arg(long, short, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List configured devices
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show every property of a device
    Props {
        /// Device index (from `list`)
        index: usize,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Capture frames and print a line per frame
    Capture {
        /// Device index (from `list`)
        index: usize,
        /// Frames to read before stopping
        #[arg(long, default_value = "10")]
        frames: u64,
        /// Ring slots to allocate
        #[arg(long, default_value = "4")]
        buffers: usize,
        /// sequence or snap
        #[arg(long, default_value = "sequence")]
        mode: CaptureMode,
        /// Exposure time in seconds
        #[arg(long)]
        exposure: Option<f64>,
        /// Imaging preset applied before allocating (area, tdi, focus-sweep)
        #[arg(long)]
        preset: Option<Preset>,
        /// Per-frame wait timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    init_tracing(cli.log_level.as_deref().unwrap_or(&settings.application.log_level));
    info!(app = %settings.application.name, devices = settings.devices.len(), "Starting");

    match cli.command {
        Command::Config => {
            print!("{}", settings.to_toml_string()?);
            Ok(())
        }
        Command::List { json } => list(&Dcam::init(&settings), json),
        Command::Props { index, json } => {
            let dcam = Dcam::init(&settings);
            let result = props(&dcam, index, json);
            dcam.shutdown();
            result
        }
        Command::Capture {
            index,
            frames,
            buffers,
            mode,
            exposure,
            preset,
            timeout_ms,
        } => {
            let dcam = Dcam::init(&settings);
            let timeout_ms = timeout_ms.unwrap_or(settings.acquisition.default_wait_timeout_ms);
            let timeout = Duration::from_millis(timeout_ms);
            let opts = CaptureOptions {
                frames,
                buffers,
                mode,
                exposure,
                preset,
                timeout,
            };
            let result = capture(&dcam, index, &opts).await;
            dcam.shutdown();
            result
        }
    }
}

fn list(dcam: &Dcam, json: bool) -> Result<()> {
    let infos = (0..dcam.device_count())
        .map(|i| dcam.device_info(i))
        .collect::<Result<Vec<_>, _>>()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&infos)?);
        return Ok(());
    }
    for info in infos {
        println!(
            "{:>3}  {:<16} {:<16} {:<12} {}",
            info.index,
            info.model,
            info.serial,
            info.vendor,
            info.interfaces.join(",")
        );
    }
    Ok(())
}

#[derive(Serialize)]
struct PropertyRow {
    #[serde(skip)]
    display_name: String,
    value: f64,
    text: String,
    #[serde(flatten)]
    attr: dcam_control::PropertyAttr,
}

fn props(dcam: &Dcam, index: usize, json: bool) -> Result<()> {
    let cam = dcam.open(index).with_context(|| format!("failed to open device {index}"))?;
    let mut rows = Vec::new();
    for id in dcam.property_ids(cam)? {
        let attr = dcam.property_attr(cam, id)?;
        let value = dcam.get_value(cam, id)?;
        rows.push(PropertyRow {
            display_name: dcam.property_name(cam, id)?,
            value,
            text: dcam.value_text(cam, id, value)?,
            attr,
        });
    }
    dcam.close(cam)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    for row in rows {
        let access = if row.attr.writable { "rw" } else { "ro" };
        println!(
            "{}  {:<32} {:<2}  {:<16} [{} .. {}]",
            row.attr.id, row.display_name, access, row.text, row.attr.min, row.attr.max
        );
    }
    Ok(())
}

struct CaptureOptions {
    frames: u64,
    buffers: usize,
    mode: CaptureMode,
    exposure: Option<f64>,
    preset: Option<Preset>,
    timeout: Duration,
}

async fn capture(dcam: &Dcam, index: usize, opts: &CaptureOptions) -> Result<()> {
    let cam = dcam.open(index).with_context(|| format!("failed to open device {index}"))?;
    let result = run_capture(dcam, cam, opts).await;
    if let Err(err) = dcam.close(cam) {
        warn!(error = %err, "Close failed");
    }
    result
}

async fn run_capture(dcam: &Dcam, cam: SessionHandle, opts: &CaptureOptions) -> Result<()> {
    if let Some(preset) = opts.preset {
        dcam.apply_preset(cam, preset)
            .with_context(|| format!("failed to apply preset {preset}"))?;
    }
    if let Some(exposure) = opts.exposure {
        let applied = dcam.set_value(cam, PropertyId::EXPOSURE_TIME, exposure)?;
        info!(requested = exposure, applied, "Exposure set");
    }

    dcam.allocate_buffers(cam, opts.buffers)?;
    dcam.start_capture(cam, opts.mode)?;

    let cancel = CancelToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    // A snap ends after one pass over the ring.
    let target = match opts.mode {
        CaptureMode::Snap => opts.frames.min(opts.buffers as u64),
        CaptureMode::Sequence => opts.frames,
    };
    let mut read = 0;
    while read < target {
        let frame = match dcam.wait_for_frame(cam, opts.timeout, &cancel).await {
            Ok(frame) => frame,
            Err(DcamError::Cancelled) => {
                info!(read, "Capture ended");
                break;
            }
            Err(err) => {
                ctrl_c.abort();
                return Err(err).context("frame wait failed");
            }
        };

        let lock = dcam.lock_frame(cam, frame.slot)?;
        let data = lock.data();
        let mean = if lock.geometry().bytes_per_pixel == 2 {
            let sum: u64 = data
                .chunks_exact(2)
                .map(|px| u64::from(u16::from_le_bytes([px[0], px[1]])))
                .sum();
            sum as f64 / (data.len() / 2).max(1) as f64
        } else {
            data.iter().map(|&px| u64::from(px)).sum::<u64>() as f64 / data.len().max(1) as f64
        };
        println!(
            "frame {:>6}  slot {:>3}  {}  exposure {:.6} s  mean {:.1}",
            lock.sequence(),
            lock.slot(),
            lock.timestamp().format("%H:%M:%S%.6f"),
            lock.exposure_s(),
            mean
        );
        dcam.unlock_frame(cam, lock)?;
        read += 1;
    }
    ctrl_c.abort();

    let info = dcam.transfer_info(cam)?;
    let dropped = info.total_frames_captured.saturating_sub(read);
    info!(
        read,
        captured = info.total_frames_captured,
        unread = dropped,
        "Capture summary"
    );

    dcam.stop_capture(cam)?;
    dcam.free_buffers(cam)?;
    Ok(())
}
