//! fx3-stream
//!
//! Streams from an FX3-class digitizer and prints bandwidth, fill
//! histograms and spectrum summaries until interrupted.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::{EventBus, EventReceiver, StopReason, StreamEvent, setup_logging};
use host::usb::{DeviceScanner, FirmwareState};
use host::{Fx3Device, HostConfig, StreamState};
use processor::CHANNELS;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

const EVENT_CAPACITY: usize = 4096;

#[derive(Parser, Debug)]
#[command(name = "fx3-stream")]
#[command(author, version, about = "Stream samples from an FX3 digitizer")]
#[command(long_about = "
Keeps a queue of bulk reads in flight against an FX3-class digitizer and runs
every received buffer through the enabled sample pipelines.

EXAMPLES:
    # Stream with defaults until Ctrl+C
    fx3-stream

    # Verify the self-test pattern for ten seconds
    fx3-stream --verify --duration-secs 10

    # Dump the first 64 MiB and print fill histograms
    fx3-stream --dump /tmp/capture.bin --dump-limit 67108864 --fill

    # Spectrum of channels 0 and 2, every 5th buffer
    fx3-stream --fft --fft-skip 5 --fft-channels 0,2

CONFIGURATION:
    1. Path specified with --config
    2. ~/.config/fx3-stream/host.toml
    3. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List matching devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Packets per transfer
    #[arg(long)]
    ppx: Option<usize>,

    /// Outstanding requests (1-64)
    #[arg(long)]
    queue_size: Option<usize>,

    /// Per-request timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Verify the incrementing self-test pattern
    #[arg(long)]
    verify: bool,

    /// Print per-channel fill histograms
    #[arg(long)]
    fill: bool,

    /// Dump raw low sample bytes to this file
    #[arg(long, value_name = "PATH")]
    dump: Option<PathBuf>,

    /// Stop dumping after this many bytes (0 = unlimited)
    #[arg(long, value_name = "BYTES")]
    dump_limit: Option<u64>,

    /// Compute per-channel spectra
    #[arg(long)]
    fft: bool,

    /// Run the FFT on every Nth buffer
    #[arg(long, value_name = "N")]
    fft_skip: Option<u32>,

    /// Channels to transform, e.g. 0,2
    #[arg(long, value_delimiter = ',', value_name = "LIST")]
    fft_channels: Option<Vec<usize>>,

    /// Stop after this many seconds
    #[arg(long, value_name = "SECS")]
    duration_secs: Option<u64>,
}

impl Args {
    /// Apply command-line overrides on top of the loaded configuration
    fn apply(&self, config: &mut HostConfig) -> Result<()> {
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if self.ppx.is_some() {
            config.stream.ppx = self.ppx;
        }
        if let Some(queue_size) = self.queue_size {
            config.stream.queue_size = queue_size;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.stream.timeout_ms = timeout_ms;
        }
        config.stream.verify_pattern |= self.verify;
        config.processing.fill_enabled |= self.fill;
        if self.dump.is_some() {
            config.processing.dump_path = self.dump.clone();
        }
        if let Some(limit) = self.dump_limit {
            config.processing.dump_limit = limit;
        }
        config.processing.fft_enabled |= self.fft;
        if let Some(skip) = self.fft_skip {
            config.processing.fft_skip_frames = skip;
        }
        if let Some(list) = &self.fft_channels {
            let mut channels = [false; CHANNELS];
            for &ch in list {
                let slot = channels
                    .get_mut(ch)
                    .ok_or_else(|| anyhow!("Invalid FFT channel {}, must be below {}", ch, CHANNELS))?;
                *slot = true;
            }
            config.processing.fft_channels = channels;
        }

        config.validate()
    }
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

    let mut config = if let Some(ref path) = args.config {
        HostConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        HostConfig::load_or_default()
    };
    args.apply(&mut config).context("Invalid configuration")?;

    setup_logging(&config.log_level).context("Failed to setup logging")?;

    info!("fx3-stream v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", config.log_level);

    if args.list_devices {
        return list_devices_mode(&config);
    }

    run_stream(config, args.duration_secs).await
}

/// List matching devices and exit
fn list_devices_mode(config: &HostConfig) -> Result<()> {
    let scanner = DeviceScanner::new(config.usb.identity()).context("Failed to initialize USB")?;

    let found = match scanner.list() {
        Ok(found) => found,
        Err(common::DeviceError::NoDeviceFound) => {
            println!("No matching devices found.");
            return Ok(());
        }
        Err(e) => return Err(e).context("Failed to scan devices"),
    };

    println!("Found {} device(s):\n", found.len());
    for dev in found {
        let state = match dev.state {
            FirmwareState::Boot => "boot image (firmware required)",
            FirmwareState::Streaming => "streaming image",
        };
        println!(
            "  {:04x}:{:04x}  Bus {:03} Device {:03}  {}",
            dev.summary.vendor_id, dev.summary.product_id, dev.summary.bus, dev.summary.address, state
        );
    }
    Ok(())
}

async fn run_stream(config: HostConfig, duration_secs: Option<u64>) -> Result<()> {
    let events = EventBus::new();
    let receiver = events.subscribe_with_capacity(EVENT_CAPACITY);
    let (stopped_tx, mut stopped_rx) = oneshot::channel();
    let printer = tokio::spawn(print_events(receiver, stopped_tx));

    let mut device = Fx3Device::new(config.clone(), events.clone());

    let started = tokio::task::block_in_place(|| -> Result<()> {
        device.open_device().context("Failed to open device")?;
        apply_processing(&device, &config)?;
        device.start_stop(true).context("Failed to start streaming")?;
        Ok(())
    });

    if let Err(e) = started {
        drop(device);
        drop(events);
        let _ = printer.await;
        return Err(e);
    }

    let mut poll = tokio::time::interval(Duration::from_millis(500));
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, stopping");
        }
        _ = run_limit(duration_secs) => {
            info!("Duration limit reached, stopping");
        }
        reason = &mut stopped_rx => {
            if let Ok(reason) = reason {
                warn!("Streaming stopped: {:?}", reason);
            }
        }
        _ = async {
            loop {
                poll.tick().await;
                if device.controller().state() == StreamState::Idle {
                    break;
                }
            }
        } => {
            warn!("Streaming session ended");
        }
    }

    tokio::task::block_in_place(|| {
        if let Err(e) = device.start_stop(false) {
            error!("Failed to stop streaming: {}", e);
        }

        let counters = device.controller().counters().snapshot();
        let integrity = device.controller().integrity().snapshot();
        info!(
            "Transferred {} bytes in {} buffers, {} failures",
            counters.bytes_xferred, counters.successes, counters.failures
        );
        if config.stream.verify_pattern {
            info!(
                "Pattern check: {} bytes, {} gaps",
                integrity.bytes_seen, integrity.gaps
            );
        }

        let processor = device.processor();
        let mut processor = processor.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = processor.enable_file_dump(false, "", 0) {
            error!("Failed to close dump: {}", e);
        }
        drop(processor);

        if let Err(e) = device.close_device() {
            error!("Failed to close device: {}", e);
        }
    });

    drop(device);
    drop(events);
    if tokio::time::timeout(Duration::from_secs(1), printer).await.is_err() {
        debug!("Event printer did not finish in time");
    }

    Ok(())
}

fn apply_processing(device: &Fx3Device, config: &HostConfig) -> Result<()> {
    let processor = device.processor();
    let mut processor = processor
        .lock()
        .map_err(|_| anyhow!("Processor lock poisoned"))?;

    processor.enable_fill_calc(config.processing.fill_enabled);
    processor.enable_fft_calc(
        config.processing.fft_enabled,
        config.processing.fft_skip_frames,
        config.processing.fft_channels,
    );
    if let Some(path) = &config.processing.dump_path {
        processor
            .enable_file_dump(true, path, config.processing.dump_limit)
            .with_context(|| format!("Failed to start dump to {}", path.display()))?;
    }
    Ok(())
}

async fn run_limit(duration_secs: Option<u64>) {
    match duration_secs {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => std::future::pending().await,
    }
}

/// Print bus events until every sender is gone
async fn print_events(receiver: EventReceiver, stopped: oneshot::Sender<StopReason>) {
    let mut stopped = Some(stopped);
    while let Ok(event) = receiver.recv().await {
        match event {
            StreamEvent::Message(text) => println!("{}", text),
            StreamEvent::Bandwidth { bytes_per_sec } => {
                println!("Bandwidth: {:.2} MB/s", bytes_per_sec as f64 / 1e6);
            }
            StreamEvent::StreamStopped { reason } => {
                println!("Streaming stopped: {:?}", reason);
                if let Some(tx) = stopped.take() {
                    let _ = tx.send(reason);
                }
            }
            StreamEvent::Spectrum { channel, bins } => {
                let peak = bins
                    .iter()
                    .enumerate()
                    .skip(1)
                    .max_by(|a, b| a.1.total_cmp(b.1));
                if let Some((bin, db)) = peak {
                    println!("Spectrum ch{}: peak {:.1} dB at bin {}", channel, db, bin);
                }
            }
            StreamEvent::Fill(report) => {
                debug!("Fill report at {} over {} samples", report.timestamp, report.samples);
            }
            StreamEvent::DumpAborted { bytes } => {
                println!("Dump limit reached after {} bytes", bytes);
            }
            StreamEvent::Samples(words) => {
                trace!("{} sample words", words.len());
            }
        }
    }
}
