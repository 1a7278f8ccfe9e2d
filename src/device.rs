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

// Device stream abstraction
//
// The recorder never talks to hardware directly. A device exposes the most
// recent row of each raw stream and the latest value of each derived score;
// staleness is up to the device.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::time::Instant;

/// Raw sensor streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RawStream {
    /// 7 columns
    Eeg,
    /// device time + x, y, z
    Imu,
    /// device time + green, red, infrared
    Ppg,
}

impl fmt::Display for RawStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RawStream::Eeg => "EEG",
            RawStream::Imu => "IMU",
            RawStream::Ppg => "PPG",
        };
        f.write_str(name)
    }
}

/// A derived score as the device reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScoreValue {
    Number(f64),
    Vector(Vec<f64>),
    Text(String),
}

pub trait DeviceStream: Send + Sync {
    fn device_id(&self) -> &str;

    /// Latest row of a raw stream, `None` if nothing has arrived yet
    fn latest_raw_row(&self, stream: RawStream) -> Option<Vec<f64>>;

    /// Latest value of a score, `None` if the device has not produced it
    fn score(&self, key: &str) -> Option<ScoreValue>;

    fn imu_calibration(&self) -> Option<Vec<f64>> {
        None
    }
}

/// Deterministic waveform generator standing in for a headband
pub struct SyntheticDevice {
    device_id: String,
    started: Instant,
}

impl SyntheticDevice {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            started: Instant::now(),
        }
    }

    fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

fn wave(t: f64, hz: f64, amplitude: f64, phase: f64) -> f64 {
    amplitude * (2.0 * PI * hz * t + phase).sin()
}

impl DeviceStream for SyntheticDevice {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn latest_raw_row(&self, stream: RawStream) -> Option<Vec<f64>> {
        let t = self.elapsed();
        let row = match stream {
            RawStream::Eeg => (0..7)
                .map(|ch| wave(t, 10.0, 40.0, ch as f64 * 0.3) + wave(t, 22.0, 8.0, 0.0))
                .collect(),
            RawStream::Imu => vec![
                t,
                wave(t, 0.2, 0.05, 0.0),
                wave(t, 0.2, 0.05, PI / 2.0),
                1.0 + wave(t, 0.1, 0.01, 0.0),
            ],
            RawStream::Ppg => vec![
                t,
                50_000.0 + wave(t, 1.2, 800.0, 0.0),
                60_000.0 + wave(t, 1.2, 600.0, 0.4),
                70_000.0 + wave(t, 1.2, 500.0, 0.8),
            ],
        };
        Some(row)
    }

    fn score(&self, key: &str) -> Option<ScoreValue> {
        let t = self.elapsed();
        let band = |base: f64| {
            ScoreValue::Vector((0..5).map(|i| base + wave(t, 0.05, 0.1, i as f64)).collect())
        };

        let value = match key {
            "focus_score" => ScoreValue::Number(50.0 + wave(t, 0.01, 30.0, 0.0)),
            "poas" => ScoreValue::Number(0.5 + wave(t, 0.02, 0.4, 0.0)),
            "posture" => {
                let posture = if (t / 30.0) as u64 % 2 == 0 { "upright" } else { "slouching" };
                ScoreValue::Text(posture.to_string())
            }
            "sleep_stage" => ScoreValue::Number(0.0),
            "sqc_scores" => ScoreValue::Vector(vec![1.0, 1.0, 0.8, 1.0]),
            "hr" => ScoreValue::Number((64.0 + wave(t, 0.01, 6.0, 0.0)).round()),
            "spo2" => ScoreValue::Number(97.0),
            "alpha" => band(0.30),
            "beta" => band(0.20),
            "gamma" => band(0.05),
            "theta" => band(0.25),
            "delta" => band(0.20),
            _ => return None,
        };
        Some(value)
    }
}
