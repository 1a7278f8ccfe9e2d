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

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, StorageError};
use crate::registry::{DatasetRegistry, SampleValue, TIMESTAMPS};

/// Pending rows of one channel, flattened row-major
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelRows {
    pub values: Vec<f64>,
    pub rows: usize,
}

impl ChannelRows {
    fn push(&mut self, elements: &[f64]) {
        self.values.extend_from_slice(elements);
        self.rows += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }
}

/// Snapshot taken by [`BufferManager::drain`]
#[derive(Debug, Clone, Default)]
pub struct DrainedBatch {
    channels: BTreeMap<String, ChannelRows>,
}

impl DrainedBatch {
    pub fn is_empty(&self) -> bool {
        self.channels.values().all(ChannelRows::is_empty)
    }

    pub fn get(&self, channel: &str) -> Option<&ChannelRows> {
        self.channels.get(channel).filter(|rows| !rows.is_empty())
    }

    /// Non-empty channels in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ChannelRows)> {
        self.channels
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(name, rows)| (name.as_str(), rows))
    }

    pub fn timestamps(&self) -> &[f64] {
        self.channels
            .get(TIMESTAMPS)
            .map(|rows| rows.values.as_slice())
            .unwrap_or(&[])
    }

    /// Rows across all channels, `timestamps` included
    pub fn total_rows(&self) -> usize {
        self.channels.values().map(|rows| rows.rows).sum()
    }

    /// Rows across data channels only
    pub fn sample_count(&self) -> usize {
        self.channels
            .iter()
            .filter(|(name, _)| name.as_str() != TIMESTAMPS)
            .map(|(_, rows)| rows.rows)
            .sum()
    }
}

/// Sample counts excluding the `timestamps` channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Pending plus drained-but-uncommitted rows
    pub buffered: u64,
    /// Rows durably committed
    pub saved: u64,
}

#[derive(Debug, Default)]
struct BufferState {
    recording: bool,
    pending: BTreeMap<String, ChannelRows>,
    in_flight: BTreeMap<String, usize>,
    saved: BTreeMap<String, u64>,
}

impl BufferState {
    fn pending_duration(&self) -> f64 {
        match self.pending.get(TIMESTAMPS) {
            Some(ts) if ts.values.len() >= 2 => {
                // Head/tail difference; arrival order is not enforced
                ts.values[ts.values.len() - 1] - ts.values[0]
            }
            _ => 0.0,
        }
    }
}

/// Per-session in-memory accumulation of samples.
///
/// All mutation happens under one lock: an append is never observed half
/// applied and a drain takes every channel at once. The recording flag lives
/// under the same lock so no append can slip in after a session stops.
pub struct BufferManager {
    registry: Arc<DatasetRegistry>,
    flush_after_seconds: f64,
    state: Mutex<BufferState>,
}

impl BufferManager {
    pub fn new(registry: Arc<DatasetRegistry>, buffer_size_minutes: f64) -> Self {
        Self {
            registry,
            flush_after_seconds: buffer_size_minutes * 60.0,
            state: Mutex::new(BufferState::default()),
        }
    }

    /// Clear all buffers and seed the committed row counts (non-zero when an
    /// existing session is reopened). Recording stays off.
    pub fn reset(&self, saved: BTreeMap<String, u64>) {
        let mut state = self.state.lock();
        state.recording = false;
        state.pending = self
            .registry
            .iter()
            .map(|d| (d.name.clone(), ChannelRows::default()))
            .collect();
        state.in_flight.clear();
        state.saved = saved;
    }

    pub fn set_recording(&self, recording: bool) {
        self.state.lock().recording = recording;
    }

    pub fn is_recording(&self) -> bool {
        self.state.lock().recording
    }

    /// Buffer one sample. Returns `true` when the buffered time span has
    /// reached the flush threshold.
    pub fn append(&self, channel: &str, value: &SampleValue, timestamp: f64) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.recording {
            return Err(StorageError::NotRecording);
        }

        let descriptor = self.registry.describe(channel)?;
        descriptor.validate(value)?;

        state
            .pending
            .entry(descriptor.name.clone())
            .or_default()
            .push(value.elements());

        if !descriptor.is_timestamps() {
            state
                .pending
                .entry(TIMESTAMPS.to_string())
                .or_default()
                .push(&[timestamp]);
        }

        Ok(state.pending_duration() >= self.flush_after_seconds)
    }

    /// Seconds between the oldest and newest buffered timestamp
    pub fn pending_duration(&self) -> f64 {
        self.state.lock().pending_duration()
    }

    /// Take every pending row and leave all channels empty
    pub fn drain(&self) -> DrainedBatch {
        let mut state = self.state.lock();
        let state = &mut *state;

        let mut channels = BTreeMap::new();
        for (name, rows) in state.pending.iter_mut() {
            if rows.is_empty() {
                continue;
            }
            *state.in_flight.entry(name.clone()).or_default() += rows.rows;
            channels.insert(name.clone(), std::mem::take(rows));
        }

        if !channels.is_empty() {
            debug!(
                "Drained {} rows from {} channels",
                channels.values().map(|r: &ChannelRows| r.rows).sum::<usize>(),
                channels.len()
            );
        }

        DrainedBatch { channels }
    }

    /// Record a drained batch as durably committed
    pub fn settle(&self, batch: &DrainedBatch) {
        let mut state = self.state.lock();
        for (name, rows) in batch.iter() {
            if let Some(in_flight) = state.in_flight.get_mut(name) {
                *in_flight = in_flight.saturating_sub(rows.rows);
            }
            *state.saved.entry(name.to_string()).or_default() += rows.rows as u64;
        }
    }

    /// Put an uncommitted batch back in front of anything appended since
    /// the drain, so the next flush retries it in order.
    pub fn restore(&self, batch: DrainedBatch) {
        let mut state = self.state.lock();
        for (name, mut rows) in batch.channels {
            if let Some(in_flight) = state.in_flight.get_mut(&name) {
                *in_flight = in_flight.saturating_sub(rows.rows);
            }
            let pending = state.pending.entry(name).or_default();
            rows.values.append(&mut pending.values);
            rows.rows += pending.rows;
            *pending = rows;
        }
    }

    pub fn stats(&self) -> BufferStats {
        let state = self.state.lock();
        let data_channels = |name: &&String| name.as_str() != TIMESTAMPS;

        let pending: usize = state
            .pending
            .iter()
            .filter(|(name, _)| data_channels(name))
            .map(|(_, rows)| rows.rows)
            .sum();
        let in_flight: usize = state
            .in_flight
            .iter()
            .filter(|(name, _)| data_channels(name))
            .map(|(_, rows)| *rows)
            .sum();
        let saved: u64 = state
            .saved
            .iter()
            .filter(|(name, _)| data_channels(name))
            .map(|(_, rows)| *rows)
            .sum();

        BufferStats {
            buffered: (pending + in_flight) as u64,
            saved,
        }
    }

    /// Committed rows per channel, `timestamps` included
    pub fn saved_lengths(&self) -> BTreeMap<String, u64> {
        self.state.lock().saved.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_manager(minutes: f64) -> BufferManager {
        let manager = BufferManager::new(Arc::new(DatasetRegistry::default()), minutes);
        manager.reset(BTreeMap::new());
        manager.set_recording(true);
        manager
    }

    #[test]
    fn test_append_pushes_shared_timestamp() {
        let manager = recording_manager(5.0);
        manager
            .append("scores/focus", &SampleValue::Scalar(0.5), 10.0)
            .unwrap();
        manager
            .append("raw/imu", &SampleValue::Vector(vec![1.0, 2.0, 3.0]), 11.0)
            .unwrap();

        let batch = manager.drain();
        assert_eq!(batch.timestamps(), &[10.0, 11.0]);
        assert_eq!(batch.get("raw/imu").unwrap().values, vec![1.0, 2.0, 3.0]);
        assert_eq!(batch.sample_count(), 2);
        assert_eq!(batch.total_rows(), 4);
    }

    #[test]
    fn test_direct_timestamp_append_is_not_doubled() {
        let manager = recording_manager(5.0);
        manager
            .append(TIMESTAMPS, &SampleValue::Scalar(42.0), 42.0)
            .unwrap();
        assert_eq!(manager.drain().timestamps(), &[42.0]);
    }

    #[test]
    fn test_append_requires_recording() {
        let manager = BufferManager::new(Arc::new(DatasetRegistry::default()), 5.0);
        manager.reset(BTreeMap::new());
        let err = manager
            .append("scores/focus", &SampleValue::Scalar(0.5), 1.0)
            .unwrap_err();
        assert!(matches!(err, StorageError::NotRecording));
    }

    #[test]
    fn test_pending_duration() {
        let manager = recording_manager(5.0);
        assert_eq!(manager.pending_duration(), 0.0);
        manager.append("scores/hr", &SampleValue::Scalar(60.0), 100.0).unwrap();
        assert_eq!(manager.pending_duration(), 0.0);
        manager.append("scores/hr", &SampleValue::Scalar(61.0), 130.5).unwrap();
        assert_eq!(manager.pending_duration(), 30.5);
    }

    #[test]
    fn test_flush_due_at_threshold() {
        let manager = recording_manager(1.0);
        for t in 0..60 {
            let due = manager
                .append("scores/focus", &SampleValue::Scalar(0.1), t as f64)
                .unwrap();
            assert!(!due, "flush signalled early at t={}", t);
        }
        assert!(manager
            .append("scores/focus", &SampleValue::Scalar(0.1), 60.0)
            .unwrap());
    }

    #[test]
    fn test_restore_keeps_order_and_counts() {
        let manager = recording_manager(5.0);
        manager.append("scores/hr", &SampleValue::Scalar(1.0), 1.0).unwrap();
        manager.append("scores/hr", &SampleValue::Scalar(2.0), 2.0).unwrap();

        let batch = manager.drain();
        assert_eq!(manager.stats().buffered, 2);

        manager.append("scores/hr", &SampleValue::Scalar(3.0), 3.0).unwrap();
        manager.restore(batch);

        assert_eq!(manager.stats(), BufferStats { buffered: 3, saved: 0 });
        let retry = manager.drain();
        assert_eq!(retry.get("scores/hr").unwrap().values, vec![1.0, 2.0, 3.0]);
        assert_eq!(retry.timestamps(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_settle_moves_rows_to_saved() {
        let manager = recording_manager(5.0);
        for i in 0..4 {
            manager
                .append("scores/poas", &SampleValue::Scalar(i as f64), i as f64)
                .unwrap();
        }
        let batch = manager.drain();
        manager.settle(&batch);

        assert_eq!(manager.stats(), BufferStats { buffered: 0, saved: 4 });
        assert_eq!(manager.saved_lengths().get(TIMESTAMPS), Some(&4));
    }
}
