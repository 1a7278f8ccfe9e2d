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

// Configuration types for biosignal-recorder

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::codec::CompressionType;
use crate::registry::DEFAULT_CHUNK_ROWS;
use crate::storage::StoreOptions;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RecorderConfig {
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    /// Replaces the built-in channel catalog when non-empty
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage engine settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageSettings {
    /// Root directory; every session gets its own subdirectory
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Backend type: "chunkfile"
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Buffered time span (minutes) that forces a flush
    #[serde(default = "default_buffer_size_minutes")]
    pub buffer_size_minutes: f64,

    /// Seconds between auto-save flushes
    #[serde(default = "default_auto_save_interval")]
    pub auto_save_interval: u64,

    #[serde(default)]
    pub compression: CompressionType,

    /// 0-9
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,

    /// Default rows per on-disk chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            backend: default_backend(),
            buffer_size_minutes: default_buffer_size_minutes(),
            auto_save_interval: default_auto_save_interval(),
            compression: CompressionType::default(),
            compression_level: default_compression_level(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl StorageSettings {
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            compression: self.compression,
            compression_level: self.compression_level,
        }
    }

    pub fn auto_save_period(&self) -> Duration {
        Duration::from_secs(self.auto_save_interval)
    }
}

/// Timing of the background tasks
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestionConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_auto_save_tick_ms")]
    pub auto_save_tick_ms: u64,

    /// Upper bound on waiting for a background task to stop
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            auto_save_tick_ms: default_auto_save_tick_ms(),
            join_timeout_ms: default_join_timeout_ms(),
        }
    }
}

impl IngestionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn auto_save_tick(&self) -> Duration {
        Duration::from_millis(self.auto_save_tick_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

/// Device metadata written next to each session
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    #[serde(default = "default_device_id")]
    pub device_id: String,

    /// Nominal sampling rate (Hz) per stream
    #[serde(default = "default_sampling_rates")]
    pub sampling_rates: BTreeMap<String, u32>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            sampling_rates: default_sampling_rates(),
        }
    }
}

/// One channel of a config-defined catalog
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelConfig {
    pub name: String,
    /// Empty for scalar channels
    #[serde(default)]
    pub shape: Vec<usize>,
    pub dtype: String,
    #[serde(default)]
    pub chunk_size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"

    #[serde(default = "default_log_format")]
    pub format: String, // "text", "json"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_data_dir() -> PathBuf { PathBuf::from("./data") }
fn default_backend() -> String { "chunkfile".to_string() }
fn default_buffer_size_minutes() -> f64 { 5.0 }
fn default_auto_save_interval() -> u64 { 300 }
fn default_compression_level() -> u32 { 4 }
fn default_chunk_size() -> usize { DEFAULT_CHUNK_ROWS }
fn default_poll_interval_ms() -> u64 { 10 }
fn default_auto_save_tick_ms() -> u64 { 1000 }
fn default_join_timeout_ms() -> u64 { 5000 }
fn default_device_id() -> String { "wearable-001".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "text".to_string() }

fn default_sampling_rates() -> BTreeMap<String, u32> {
    [("eeg", 125), ("imu", 50), ("ppg", 25), ("hr", 1), ("spo2", 1)]
        .into_iter()
        .map(|(stream, hz)| (stream.to_string(), hz))
        .collect()
}
