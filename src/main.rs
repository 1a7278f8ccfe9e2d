// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use biosignal_recorder::config::{apply_env_overrides, load_config_with_env, RecorderConfig};
use biosignal_recorder::{Collector, ControlInterface, DeviceStream, StorageEngine, SyntheticDevice};

/// Biosignal Recorder - buffered, crash-safe recording of wearable streams
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/default.yaml")]
    config: PathBuf,

    /// Data directory (overrides config file)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Device ID (overrides config file)
    #[arg(short, long)]
    device_id: Option<String>,

    /// Session ID for the recording (generated if omitted)
    #[arg(long)]
    session_id: Option<String>,

    /// Record for this many seconds, then finalize and exit. Without it the
    /// recorder serves JSON control commands on stdin.
    #[arg(long)]
    duration: Option<u64>,
}

fn init_tracing(config: &RecorderConfig) -> Result<()> {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match config.logging.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    let mut config = if args.config.exists() {
        load_config_with_env(&args.config)?
    } else {
        let mut config = RecorderConfig::default();
        apply_env_overrides(&mut config)?;
        config
    };

    // Apply CLI overrides
    if let Some(data_dir) = args.data_dir {
        config.storage.data_dir = data_dir;
    }
    if let Some(device_id) = args.device_id {
        config.device.device_id = device_id;
    }

    init_tracing(&config)?;

    info!("Starting Biosignal Recorder");
    if args.config.exists() {
        info!("Loaded configuration from: {:?}", args.config);
    } else {
        warn!("Config file {:?} not found, using defaults", args.config);
    }
    info!("Device ID: {}", config.device.device_id);
    info!(
        "Storage: {} in {} ({} min buffer, {}s auto-save, {} level {})",
        config.storage.backend,
        config.storage.data_dir.display(),
        config.storage.buffer_size_minutes,
        config.storage.auto_save_interval,
        config.storage.compression,
        config.storage.compression_level
    );

    let engine = Arc::new(StorageEngine::from_config(&config)?);
    let device: Arc<dyn DeviceStream> = Arc::new(SyntheticDevice::new(config.device.device_id.clone()));
    let collector = Arc::new(Collector::new(
        engine.clone(),
        device,
        config.device.clone(),
        &config.ingestion,
    ));

    match args.duration {
        Some(seconds) => record_for(&collector, args.session_id, seconds).await?,
        None => serve_control(&collector, &engine).await?,
    }

    info!("Biosignal Recorder shut down successfully");
    Ok(())
}

async fn record_for(collector: &Collector, session_id: Option<String>, seconds: u64) -> Result<()> {
    let session_id = collector
        .start_recording(session_id)
        .await
        .context("Failed to start recording")?;
    info!("Recording {} for {} seconds", session_id, seconds);

    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    let mut progress = tokio::time::interval(Duration::from_secs(30));
    progress.tick().await;

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, finalizing");
                break;
            }
            _ = progress.tick() => {
                let stats = collector.get_session_stats();
                info!(
                    "Recording... {:.0}s elapsed, {} samples collected, {} buffered",
                    stats.duration_seconds,
                    stats.samples_collected,
                    stats.storage_stats.buffered_samples
                );
            }
        }
    }

    let summary = collector.stop_recording().await.context("Failed to finalize recording")?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn serve_control(collector: &Arc<Collector>, engine: &StorageEngine) -> Result<()> {
    let control = ControlInterface::new(collector.clone());
    let stdin = BufReader::new(tokio::io::stdin());

    tokio::select! {
        result = control.run(stdin, tokio::io::stdout()) => {
            if let Err(e) = result {
                error!("Control interface error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    // Never leave a session open on exit
    if collector.has_session() {
        let summary = collector.stop_recording().await?;
        info!("Finalized session {} on exit", summary.session_id);
    } else if let Some(summary) = engine.shutdown().await? {
        info!("Finalized session {} on exit", summary.session_id);
    }
    Ok(())
}
