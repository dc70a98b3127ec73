//! CLI Entry Point for camdaq
//!
//! Drives the acquisition core end to end against the in-process mock camera.
//!
//! # Usage
//!
//! Acquire 100 free-running frames:
//! ```bash
//! camdaq run --frames 100
//! ```
//!
//! Synchronized acquisition, one software trigger every 50 ms:
//! ```bash
//! camdaq run --sync --trigger-period 50ms
//! ```
//!
//! Print the effective configuration:
//! ```bash
//! camdaq config --config camdaq.toml
//! ```

use anyhow::{anyhow, Context, Result};
use camdaq::config::{AppConfig, DEFAULT_CONFIG_FILE};
use camdaq::tracing_setup;
use camdaq_core::frame::Frame;
use camdaq_driver::mock::MockCamera;
use camdaq_driver::{CameraDriver, EventSource, ManualEventSource};
use clap::{Parser, Subcommand};
use humantime_serde::re::humantime;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "camdaq")]
#[command(about = "Scientific camera acquisition core (mock camera)", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire frames from the mock camera
    Run {
        /// Stop after this many frames (runs until Ctrl-C if omitted)
        #[arg(long)]
        frames: Option<u64>,

        /// Start every exposure from a software trigger event
        #[arg(long)]
        sync: bool,

        /// Interval between trigger events in synchronized mode
        #[arg(long, default_value = "50ms", value_parser = humantime::parse_duration)]
        trigger_period: Duration,

        /// Mock frame period in free-running mode
        #[arg(long, default_value = "10ms", value_parser = humantime::parse_duration)]
        frame_period: Duration,
    },

    /// Print the effective configuration as JSON
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    config.validate().map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Run {
            frames,
            sync,
            trigger_period,
            frame_period,
        } => {
            tracing_setup::init_from_config(&config).map_err(|e| anyhow!(e))?;
            run(config, frames, sync.then_some(trigger_period), frame_period).await
        }
        Commands::Config => {
            let json = serde_json::to_string_pretty(&config)
                .context("serializing configuration")?;
            println!("{json}");
            Ok(())
        }
    }
}

async fn run(
    config: AppConfig,
    frame_limit: Option<u64>,
    trigger_period: Option<Duration>,
    frame_period: Duration,
) -> Result<()> {
    let camera = MockCamera::with_sensor(
        config.camera.name.clone(),
        config.camera.sensor_width,
        config.camera.sensor_height,
    );
    let control = camera.control();
    control.set_auto_fill(Some(frame_period));

    let driver = Arc::new(CameraDriver::new(
        Box::new(camera),
        config.camera.settings.clone(),
        config.acquisition.clone(),
    ));

    let mut status = driver.subscribe_status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            info!(status = %current, "Camera status");
        }
    });

    if let Some(period) = trigger_period {
        let source = ManualEventSource::new();
        driver.synchronize_on(Some(source.clone() as Arc<dyn EventSource>));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if !source.fire() {
                    break;
                }
            }
        });
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let starter = driver.clone();
    tokio::task::spawn_blocking(move || {
        starter.start(move |frame| {
            let _ = tx.send(frame);
        })
    })
    .await
    .context("acquisition start task failed")?
    .context("starting acquisition")?;
    info!(camera = %driver.name(), synchronized = trigger_period.is_some(), "Acquiring");

    let mut received = 0u64;
    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                received += 1;
                let meta = &frame.metadata;
                info!(
                    frame = meta.frame_number,
                    bytes = frame.payload.len(),
                    mean = mean_intensity(&frame),
                    discarded = meta.discarded,
                    acquired = %meta.acquisition_date,
                    hardware_time = ?meta.hardware_timestamp,
                    "Frame"
                );
                debug!(metadata = ?meta.to_map(), "Frame metadata");
                if frame_limit.is_some_and(|limit| received >= limit) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    driver.synchronize_on(None);
    driver.stop();
    let stopper = driver.clone();
    let timeout = config.acquisition.startup_timeout;
    let stopped = tokio::task::spawn_blocking(move || stopper.wait_stopped(timeout))
        .await
        .context("acquisition stop task failed")?;
    if let Err(e) = stopped {
        warn!(error = %e, "Acquisition ended with an error");
    }

    let stats = driver.stats();
    info!(
        received,
        delivered = stats.frames_delivered,
        discarded = stats.frames_discarded,
        timeouts = stats.timeouts,
        overflows = stats.overflows,
        reconnections = stats.reconnections,
        "Done"
    );
    Ok(())
}

/// Mean pixel value of a 16-bit frame, `NaN` for other encodings.
fn mean_intensity(frame: &Frame) -> f64 {
    match frame.pixels_u16() {
        Some(pixels) if !pixels.is_empty() => {
            pixels.iter().map(|&p| f64::from(p)).sum::<f64>() / pixels.len() as f64
        }
        _ => f64::NAN,
    }
}
