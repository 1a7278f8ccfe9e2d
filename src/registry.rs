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

//! Dataset registry: the static catalog of recordable channels.
//!
//! Every channel has a fixed per-sample shape (empty for scalars, `[k]` for
//! fixed-width vectors), a numeric element type and the number of rows that
//! make up one on-disk chunk. The catalog never changes while a session is
//! open.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::config::ChannelConfig;
use crate::error::{Result, StorageError};

/// Name of the shared arrival-timestamp channel
pub const TIMESTAMPS: &str = "timestamps";

/// Default number of rows per on-disk chunk
pub const DEFAULT_CHUNK_ROWS: usize = 10_000;

/// Numeric element type of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Int8,
    Int16,
    Int32,
    Float32,
    Float64,
}

impl DType {
    /// Size in bytes of one element
    pub fn width(self) -> usize {
        match self {
            DType::Int8 => 1,
            DType::Int16 => 2,
            DType::Int32 | DType::Float32 => 4,
            DType::Float64 => 8,
        }
    }

    /// Stable code used in the container file
    pub fn code(self) -> u8 {
        match self {
            DType::Int8 => 1,
            DType::Int16 => 2,
            DType::Int32 => 3,
            DType::Float32 => 4,
            DType::Float64 => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(DType::Int8),
            2 => Some(DType::Int16),
            3 => Some(DType::Int32),
            4 => Some(DType::Float32),
            5 => Some(DType::Float64),
            _ => None,
        }
    }
}

impl FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "int8" | "i8" => Ok(DType::Int8),
            "int16" | "i16" => Ok(DType::Int16),
            "int32" | "i32" => Ok(DType::Int32),
            "float32" | "f32" => Ok(DType::Float32),
            "float64" | "f64" => Ok(DType::Float64),
            other => Err(format!(
                "unknown dtype '{}'. Supported: int8, int16, int32, float32, float64",
                other
            )),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::Int8 => "int8",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        };
        f.write_str(name)
    }
}

/// One sample value as handed to the append API. Values are carried as
/// `f64` until they are encoded into the channel's element type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleValue {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl SampleValue {
    pub fn shape(&self) -> Vec<usize> {
        match self {
            SampleValue::Scalar(_) => Vec::new(),
            SampleValue::Vector(v) => vec![v.len()],
        }
    }

    /// Flattened elements of this sample
    pub fn elements(&self) -> &[f64] {
        match self {
            SampleValue::Scalar(v) => std::slice::from_ref(v),
            SampleValue::Vector(v) => v,
        }
    }
}

impl From<f64> for SampleValue {
    fn from(v: f64) -> Self {
        SampleValue::Scalar(v)
    }
}

impl From<Vec<f64>> for SampleValue {
    fn from(v: Vec<f64>) -> Self {
        SampleValue::Vector(v)
    }
}

/// Registry entry describing one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub chunk_size: usize,
}

impl ChannelDescriptor {
    pub fn scalar(name: &str, dtype: DType, chunk_size: usize) -> Self {
        Self {
            name: name.to_string(),
            shape: Vec::new(),
            dtype,
            chunk_size,
        }
    }

    pub fn vector(name: &str, width: usize, dtype: DType, chunk_size: usize) -> Self {
        Self {
            name: name.to_string(),
            shape: vec![width],
            dtype,
            chunk_size,
        }
    }

    /// Elements per row (1 for scalar channels)
    pub fn row_width(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_timestamps(&self) -> bool {
        self.name == TIMESTAMPS
    }

    pub fn validate(&self, value: &SampleValue) -> Result<()> {
        let actual = value.shape();
        if actual != self.shape {
            return Err(StorageError::ShapeMismatch {
                channel: self.name.clone(),
                expected: self.shape.clone(),
                actual,
            });
        }
        Ok(())
    }
}

/// Static channel catalog
#[derive(Debug, Clone)]
pub struct DatasetRegistry {
    channels: BTreeMap<String, ChannelDescriptor>,
}

impl DatasetRegistry {
    /// Build a registry from descriptors. The `timestamps` channel is always
    /// present; it is added as a float64 scalar if the list omits it.
    pub fn new(descriptors: impl IntoIterator<Item = ChannelDescriptor>) -> Self {
        let mut channels: BTreeMap<String, ChannelDescriptor> = descriptors
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();

        channels
            .entry(TIMESTAMPS.to_string())
            .or_insert_with(|| {
                ChannelDescriptor::scalar(TIMESTAMPS, DType::Float64, DEFAULT_CHUNK_ROWS)
            });

        Self { channels }
    }

    /// Built-in catalog for the FRENZ brainband: raw waveforms, derived
    /// scores and EEG power bands.
    pub fn builtin(chunk_size: usize) -> Self {
        use DType::*;

        let mut descriptors = vec![
            ChannelDescriptor::vector("raw/eeg", 7, Float32, chunk_size),
            ChannelDescriptor::vector("raw/imu", 3, Float32, chunk_size),
            ChannelDescriptor::vector("raw/ppg", 3, Float32, chunk_size),
            ChannelDescriptor::vector("filtered/eeg", 7, Float32, chunk_size),
            ChannelDescriptor::scalar("scores/poas", Float32, chunk_size),
            ChannelDescriptor::scalar("scores/focus", Float32, chunk_size),
            ChannelDescriptor::scalar("scores/posture", Int8, chunk_size),
            ChannelDescriptor::scalar("scores/sleep_stage", Int8, chunk_size),
            ChannelDescriptor::vector("scores/signal_quality", 4, Float32, chunk_size),
            ChannelDescriptor::scalar("scores/hr", Int16, chunk_size),
            ChannelDescriptor::scalar("scores/spo2", Int16, chunk_size),
            ChannelDescriptor::scalar(TIMESTAMPS, Float64, chunk_size),
        ];

        // LF, OTEL, RF, OTER, AVG
        for band in ["alpha", "beta", "gamma", "theta", "delta"] {
            descriptors.push(ChannelDescriptor::vector(
                &format!("power_bands/{}", band),
                5,
                Float32,
                chunk_size,
            ));
        }

        Self::new(descriptors)
    }

    /// Build the registry from configured channels, falling back to the
    /// built-in catalog when none are configured.
    pub fn from_config(
        channels: &[ChannelConfig],
        default_chunk: usize,
    ) -> std::result::Result<Self, String> {
        if channels.is_empty() {
            return Ok(Self::builtin(default_chunk));
        }

        let mut descriptors = Vec::with_capacity(channels.len());
        for channel in channels {
            if channel.shape.len() > 1 {
                return Err(format!(
                    "channel '{}': only scalar or 1-D shapes are supported",
                    channel.name
                ));
            }
            descriptors.push(ChannelDescriptor {
                name: channel.name.clone(),
                shape: channel.shape.clone(),
                dtype: channel.dtype.parse()?,
                chunk_size: channel.chunk_size.unwrap_or(default_chunk),
            });
        }

        Ok(Self::new(descriptors))
    }

    pub fn describe(&self, channel: &str) -> Result<&ChannelDescriptor> {
        self.channels
            .get(channel)
            .ok_or_else(|| StorageError::UnknownChannel(channel.to_string()))
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelDescriptor> {
        self.channels.values()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl Default for DatasetRegistry {
    fn default() -> Self {
        Self::builtin(DEFAULT_CHUNK_ROWS)
    }
}
