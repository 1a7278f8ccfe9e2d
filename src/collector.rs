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

// Ingestion coordinator
//
// Polls a device stream at a fixed cadence and pushes the latest readings
// into the storage engine. One poll cycle visits every source once; missing
// readings are skipped, rejected samples are counted and ingestion goes on.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{DeviceConfig, IngestionConfig};
use crate::device::{DeviceStream, RawStream, ScoreValue};
use crate::error::{Result, StorageError};
use crate::registry::SampleValue;
use crate::session::{SessionStats, SessionSummary, StorageEngine};

pub const DEVICE_CONFIG_FILE: &str = "device_config.json";

/// Raw stream -> channel, with the number of leading columns to drop
const RAW_SOURCES: [(RawStream, &str, usize); 3] = [
    (RawStream::Eeg, "raw/eeg", 0),
    (RawStream::Imu, "raw/imu", 1),
    (RawStream::Ppg, "raw/ppg", 1),
];

/// Device score key -> channel
const SCORE_SOURCES: [(&str, &str); 12] = [
    ("focus_score", "scores/focus"),
    ("poas", "scores/poas"),
    ("posture", "scores/posture"),
    ("sleep_stage", "scores/sleep_stage"),
    ("sqc_scores", "scores/signal_quality"),
    ("hr", "scores/hr"),
    ("spo2", "scores/spo2"),
    ("alpha", "power_bands/alpha"),
    ("beta", "power_bands/beta"),
    ("gamma", "power_bands/gamma"),
    ("theta", "power_bands/theta"),
    ("delta", "power_bands/delta"),
];

/// Numeric code stored for a textual posture reading
pub fn posture_code(text: &str) -> f64 {
    match text.to_ascii_lowercase().as_str() {
        "upright" => 1.0,
        "slouching" => 2.0,
        _ => 0.0,
    }
}

/// Convert a score reading to a sample. Text is only meaningful for
/// posture; any other text reading is skipped, even if it looks numeric.
pub fn score_to_sample(key: &str, value: ScoreValue) -> Option<SampleValue> {
    match value {
        ScoreValue::Number(n) => Some(SampleValue::Scalar(n)),
        ScoreValue::Vector(v) => Some(SampleValue::Vector(v)),
        ScoreValue::Text(text) if key == "posture" => Some(SampleValue::Scalar(posture_code(&text))),
        ScoreValue::Text(_) => None,
    }
}

/// Counters updated by the ingestion task
#[derive(Debug, Default)]
pub struct CollectionStats {
    samples_collected: AtomicU64,
    errors: AtomicU64,
    skipped: AtomicU64,
    last_data_time: Mutex<Option<f64>>,
    per_channel: DashMap<String, u64>,
}

/// Point-in-time copy of [`CollectionStats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionSnapshot {
    pub samples_collected: u64,
    pub errors_count: u64,
    /// Readings that were present but not storable
    pub skipped: u64,
    pub last_data_time: Option<f64>,
    pub per_channel: BTreeMap<String, u64>,
}

impl CollectionSnapshot {
    pub fn channels_seen(&self) -> Vec<String> {
        self.per_channel.keys().cloned().collect()
    }
}

impl CollectionStats {
    pub fn reset(&self) {
        self.samples_collected.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.skipped.store(0, Ordering::Relaxed);
        *self.last_data_time.lock() = None;
        self.per_channel.clear();
    }

    fn record_sample(&self, channel: &str, at: f64) {
        self.samples_collected.fetch_add(1, Ordering::Relaxed);
        *self.per_channel.entry(channel.to_string()).or_default() += 1;
        *self.last_data_time.lock() = Some(at);
    }

    fn record_skip(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CollectionSnapshot {
        CollectionSnapshot {
            samples_collected: self.samples_collected.load(Ordering::Relaxed),
            errors_count: self.errors.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            last_data_time: *self.last_data_time.lock(),
            per_channel: self
                .per_channel
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
        }
    }
}

/// Returned by [`Collector::stop_recording`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingSummary {
    pub session_id: String,
    pub start_time: f64,
    pub end_time: f64,
    pub duration_seconds: f64,
    pub samples_collected: u64,
    pub errors_count: u64,
    pub data_types_collected: Vec<String>,
    pub average_collection_rate: f64,
    pub storage_summary: SessionSummary,
}

/// Returned by [`Collector::get_session_stats`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorStats {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub duration_seconds: f64,
    pub samples_collected: u64,
    pub collection_rate_hz: f64,
    pub errors_count: u64,
    pub skipped: u64,
    pub data_types_active: Vec<String>,
    pub last_data_time: Option<f64>,
    pub time_since_last_data: f64,
    pub storage_stats: SessionStats,
}

#[derive(Debug, Clone)]
struct ActiveRecording {
    session_id: String,
    start_time: f64,
}

/// Which device sources feed which channel of the engine's registry
#[derive(Debug, Clone)]
struct Sources {
    raw: Vec<(RawStream, String, usize)>,
    scores: Vec<(String, String)>,
}

impl Sources {
    fn for_engine(engine: &StorageEngine) -> Self {
        let registry = engine.registry();
        Self {
            raw: RAW_SOURCES
                .iter()
                .filter(|(_, channel, _)| registry.contains(channel))
                .map(|(stream, channel, skip)| (*stream, channel.to_string(), *skip))
                .collect(),
            scores: SCORE_SOURCES
                .iter()
                .filter(|(_, channel)| registry.contains(channel))
                .map(|(key, channel)| (key.to_string(), channel.to_string()))
                .collect(),
        }
    }
}

/// Orchestrates a recording: storage session, device metadata and the
/// ingestion task.
pub struct Collector {
    engine: Arc<StorageEngine>,
    device: Arc<dyn DeviceStream>,
    device_config: DeviceConfig,
    poll_interval: Duration,
    join_timeout: Duration,
    sources: Sources,
    stats: Arc<CollectionStats>,
    worker: AsyncMutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
    active: Mutex<Option<ActiveRecording>>,
}

impl Collector {
    pub fn new(
        engine: Arc<StorageEngine>,
        device: Arc<dyn DeviceStream>,
        device_config: DeviceConfig,
        timing: &IngestionConfig,
    ) -> Self {
        let sources = Sources::for_engine(&engine);
        Self {
            engine,
            device,
            device_config,
            poll_interval: timing.poll_interval(),
            join_timeout: timing.join_timeout(),
            sources,
            stats: Arc::new(CollectionStats::default()),
            worker: AsyncMutex::new(None),
            active: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    /// A session was started here and is not finalized yet
    pub fn has_session(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Samples are still being accepted for the current session
    pub fn is_recording(&self) -> bool {
        self.has_session() && self.engine.is_recording()
    }

    pub fn stats(&self) -> CollectionSnapshot {
        self.stats.snapshot()
    }

    /// Open a storage session, write device metadata and start ingesting
    pub async fn start_recording(&self, session_id: Option<String>) -> Result<String> {
        let mut worker = self.worker.lock().await;
        if let Some(active) = self.active.lock().as_ref() {
            warn!("Recording session already active");
            return Err(StorageError::SessionActive(active.session_id.clone()));
        }

        info!(
            "Starting recording session with device: {}",
            self.device.device_id()
        );
        let session_id = self.engine.initialize_session(session_id).await?;
        let start_time = self.engine.clock().now();

        if let Err(e) = self.save_device_metadata(start_time).await {
            error!("Error saving device metadata: {}", e);
        }

        self.stats.reset();
        *self.active.lock() = Some(ActiveRecording {
            session_id: session_id.clone(),
            start_time,
        });

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(ingest_loop(
            self.engine.clone(),
            self.device.clone(),
            self.sources.clone(),
            self.stats.clone(),
            self.poll_interval,
            stop_rx,
        ));
        *worker = Some((stop_tx, handle));

        info!("Recording session started: {}", session_id);
        Ok(session_id)
    }

    /// Stop ingesting and run the final flush, leaving the session open for
    /// finalization. Returns the number of samples flushed.
    pub async fn stop_ingestion(&self) -> Result<usize> {
        let mut worker = self.worker.lock().await;
        let Some(session_id) = self.active.lock().as_ref().map(|a| a.session_id.clone()) else {
            return Err(StorageError::NotRecording);
        };

        info!("Stopping ingestion for session {}", session_id);
        if let Some((stop_tx, handle)) = worker.take() {
            stop_worker(stop_tx, handle, self.join_timeout).await;
        }
        self.engine.stop_recording().await
    }

    /// Stop ingesting, finalize the storage session and summarize
    pub async fn stop_recording(&self) -> Result<RecordingSummary> {
        let mut worker = self.worker.lock().await;
        let Some(active) = self.active.lock().take() else {
            warn!("No active recording session");
            return Err(StorageError::NotRecording);
        };

        info!("Stopping recording session {}", active.session_id);
        if let Some((stop_tx, handle)) = worker.take() {
            stop_worker(stop_tx, handle, self.join_timeout).await;
        }

        let storage_summary = self.engine.finalize_session().await?;

        let end_time = self.engine.clock().now();
        let duration = end_time - active.start_time;
        let collected = self.stats.snapshot();
        let average_collection_rate = if duration > 0.0 {
            collected.samples_collected as f64 / duration
        } else {
            0.0
        };

        info!(
            "Duration: {:.1}s, Samples: {}",
            duration, collected.samples_collected
        );

        Ok(RecordingSummary {
            session_id: active.session_id,
            start_time: active.start_time,
            end_time,
            duration_seconds: duration,
            samples_collected: collected.samples_collected,
            errors_count: collected.errors_count,
            data_types_collected: collected.channels_seen(),
            average_collection_rate,
            storage_summary,
        })
    }

    pub fn get_session_stats(&self) -> CollectorStats {
        let now = self.engine.clock().now();
        let active = self.active.lock().clone();
        let collected = self.stats.snapshot();

        let (status, session_id, duration) = match &active {
            Some(active) => (
                if self.engine.is_recording() {
                    "recording"
                } else {
                    "not_recording"
                },
                Some(active.session_id.clone()),
                now - active.start_time,
            ),
            None => ("not_recording", None, 0.0),
        };

        CollectorStats {
            status: status.to_string(),
            session_id,
            duration_seconds: duration,
            samples_collected: collected.samples_collected,
            collection_rate_hz: if duration > 0.0 {
                collected.samples_collected as f64 / duration
            } else {
                0.0
            },
            errors_count: collected.errors_count,
            skipped: collected.skipped,
            data_types_active: collected.channels_seen(),
            last_data_time: collected.last_data_time,
            time_since_last_data: collected
                .last_data_time
                .map(|t| now - t)
                .unwrap_or(0.0),
            storage_stats: self.engine.get_session_stats(),
        }
    }

    /// Run a single poll cycle outside the background task
    pub async fn poll_once(&self) -> usize {
        poll_device(&self.engine, self.device.as_ref(), &self.sources, &self.stats).await
    }

    async fn save_device_metadata(&self, start_time: f64) -> Result<()> {
        let Some(dir) = self.engine.session_dir() else {
            return Ok(());
        };

        let device_id = match self.device.device_id() {
            "" => self.device_config.device_id.as_str(),
            id => id,
        };
        let rates: serde_json::Map<String, serde_json::Value> = self
            .device_config
            .sampling_rates
            .iter()
            .map(|(stream, hz)| (format!("{}_sampling_rate", stream), json!(hz)))
            .collect();

        let metadata = json!({
            "device_id": device_id,
            "session_start_time": start_time,
            "imu_calibration": self.device.imu_calibration(),
            "device_configuration": rates,
        });

        let path = dir.join(DEVICE_CONFIG_FILE);
        let bytes = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| StorageError::io("serialize device metadata", std::io::Error::other(e)))?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| StorageError::io(format!("write {}", path.display()), e))?;

        info!("Device metadata saved to {}", path.display());
        Ok(())
    }
}

async fn stop_worker(stop_tx: watch::Sender<bool>, mut handle: JoinHandle<()>, join_timeout: Duration) {
    let _ = stop_tx.send(true);
    match tokio::time::timeout(join_timeout, &mut handle).await {
        Ok(Ok(())) => info!("Data collection worker stopped"),
        Ok(Err(e)) => warn!("Data collection worker ended abnormally: {}", e),
        Err(_) => {
            warn!(
                "Data collection worker did not stop within {:?}, aborting it",
                join_timeout
            );
            handle.abort();
        }
    }
}

async fn ingest_loop(
    engine: Arc<StorageEngine>,
    device: Arc<dyn DeviceStream>,
    sources: Sources,
    stats: Arc<CollectionStats>,
    poll_interval: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    info!("Data collection worker started");

    loop {
        if *stop_rx.borrow() || !engine.is_recording() {
            break;
        }

        poll_device(&engine, device.as_ref(), &sources, &stats).await;

        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    debug!("Data collection loop exited");
}

/// One pass over every source. Returns the number of accepted samples.
async fn poll_device(
    engine: &StorageEngine,
    device: &dyn DeviceStream,
    sources: &Sources,
    stats: &CollectionStats,
) -> usize {
    let now = engine.clock().now();
    let mut readings: Vec<(&str, SampleValue)> = Vec::new();

    for (stream, channel, skip) in &sources.raw {
        let Some(row) = device.latest_raw_row(*stream) else {
            continue;
        };
        if row.len() <= *skip {
            stats.record_skip();
            continue;
        }
        readings.push((channel.as_str(), SampleValue::Vector(row[*skip..].to_vec())));
    }

    for (key, channel) in &sources.scores {
        let Some(value) = device.score(key) else {
            continue;
        };
        match score_to_sample(key, value) {
            Some(sample) => readings.push((channel.as_str(), sample)),
            None => stats.record_skip(),
        }
    }

    let mut accepted = 0;
    for (channel, sample) in readings {
        match engine.append(channel, sample, Some(now)).await {
            Ok(()) => {
                stats.record_sample(channel, now);
                accepted += 1;
            }
            Err(e) if e.is_validation() => {
                warn!("Skipping {} sample: {}", channel, e);
                stats.record_skip();
            }
            Err(StorageError::NotRecording) => break,
            Err(e) => {
                error!("Error appending {} sample: {}", channel, e);
                stats.record_error();
            }
        }
    }
    accepted
}
