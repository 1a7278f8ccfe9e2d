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
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferManager, DrainedBatch};
use crate::error::{Result, StorageError};
use crate::registry::DatasetRegistry;
use crate::storage::StorageBackend;

/// Outcome bookkeeping of the flush path
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushStatus {
    /// Clock time of the last successful flush (or of session start)
    pub last_save_time: f64,
    pub flush_count: u64,
    pub flush_failures: u64,
    pub last_flush_error: Option<String>,
}

#[derive(Default)]
struct StoreSlot {
    backend: Option<Box<dyn StorageBackend>>,
    /// Frames may be staged without a commit or rollback behind them
    unsettled: bool,
}

impl StoreSlot {
    /// Roll back whatever an interrupted flush left staged
    async fn discard_unsettled(&mut self) -> Result<()> {
        if !self.unsettled {
            return Ok(());
        }
        if let Some(store) = self.backend.as_mut() {
            warn!("Rolling back frames staged by an interrupted flush");
            store.rollback_staged().await?;
        }
        self.unsettled = false;
        Ok(())
    }
}

/// A drained batch on its way into the store.
///
/// Holds the store lock for its whole life. If it is dropped before
/// [`InFlight::finish`] (the flush future was cancelled) the rows go back in
/// front of the buffers and the slot stays marked unsettled, so the next
/// holder of the lock rolls the staged frames back.
struct InFlight<'a> {
    slot: MutexGuard<'a, StoreSlot>,
    buffers: &'a BufferManager,
    batch: Option<DrainedBatch>,
}

impl InFlight<'_> {
    async fn commit(&mut self, engine: &FlushEngine) -> Result<usize> {
        let Some(batch) = self.batch.as_ref() else {
            return Ok(0);
        };
        let slot = &mut *self.slot;
        let store = slot
            .backend
            .as_mut()
            .ok_or_else(|| StorageError::StoreFormat("no store attached".to_string()))?;
        slot.unsettled = true;
        engine.commit(store.as_mut(), batch).await
    }

    /// Settle the batch after a commit, or put it back after a failure
    fn finish(mut self, outcome: &Result<usize>) {
        if let Some(batch) = self.batch.take() {
            match outcome {
                Ok(_) => self.buffers.settle(&batch),
                Err(_) => self.buffers.restore(batch),
            }
        }
        // A failed rollback is retried by the next flush
        self.slot.unsettled = matches!(
            outcome,
            Err(StorageError::Commit {
                rolled_back: false,
                ..
            })
        );
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(batch) = self.batch.take() {
            warn!(
                "Flush interrupted with {} rows in flight, returning them to the buffers",
                batch.total_rows()
            );
            self.buffers.restore(batch);
        }
    }
}

/// Transactional writer between the buffers and the open store.
///
/// The store handle lives behind an async mutex that is held for the whole
/// drain-write-settle sequence, so commits never interleave. The buffer lock
/// is only taken briefly inside that section. A flush that is cancelled
/// mid-commit loses nothing: its rows return to the buffers and its staged
/// frames are rolled back before the store is used again.
pub struct FlushEngine {
    registry: Arc<DatasetRegistry>,
    store: AsyncMutex<StoreSlot>,
    status: Mutex<FlushStatus>,
}

impl FlushEngine {
    pub fn new(registry: Arc<DatasetRegistry>) -> Self {
        Self {
            registry,
            store: AsyncMutex::new(StoreSlot::default()),
            status: Mutex::new(FlushStatus::default()),
        }
    }

    /// Take ownership of an opened store and restart the bookkeeping
    pub async fn attach(&self, backend: Box<dyn StorageBackend>, now: f64) {
        *self.store.lock().await = StoreSlot {
            backend: Some(backend),
            unsettled: false,
        };
        *self.status.lock() = FlushStatus {
            last_save_time: now,
            ..Default::default()
        };
    }

    /// Release the store handle. Waits for an in-progress commit.
    pub async fn detach(&self) -> Option<Box<dyn StorageBackend>> {
        let mut slot = self.store.lock().await;
        if let Err(e) = slot.discard_unsettled().await {
            warn!("Releasing store with unsealed frames: {}", e);
        }
        slot.unsettled = false;
        slot.backend.take()
    }

    pub async fn is_attached(&self) -> bool {
        self.store.lock().await.backend.is_some()
    }

    pub fn status(&self) -> FlushStatus {
        self.status.lock().clone()
    }

    pub fn last_save_time(&self) -> f64 {
        self.status.lock().last_save_time
    }

    /// Committed lengths and file size of the attached store
    pub async fn store_snapshot(&self) -> Result<(BTreeMap<String, u64>, u64)> {
        let mut slot = self.store.lock().await;
        slot.discard_unsettled().await?;
        let store = slot
            .backend
            .as_ref()
            .ok_or_else(|| StorageError::StoreFormat("no store attached".to_string()))?;
        Ok((store.channel_lengths(), store.file_size().await?))
    }

    /// Drain every buffer and commit the batch. Returns the number of data
    /// samples written; an empty drain is a successful no-op.
    ///
    /// On failure the batch is put back in front of the buffers so the next
    /// flush retries it, and the error is recorded in [`FlushStatus`].
    pub async fn flush(&self, buffers: &BufferManager, now: f64) -> Result<usize> {
        let mut slot = self.store.lock().await;
        if let Err(e) = slot.discard_unsettled().await {
            self.record_failure(&e);
            return Err(e);
        }

        let batch = buffers.drain();
        if batch.is_empty() {
            self.status.lock().last_save_time = now;
            return Ok(0);
        }
        let channels = batch.iter().count();
        let timestamps = batch.timestamps().len();
        let rows = batch.total_rows();

        let mut in_flight = InFlight {
            slot,
            buffers,
            batch: Some(batch),
        };
        let outcome = in_flight.commit(self).await;
        in_flight.finish(&outcome);

        match outcome {
            Ok(written) => {
                let mut status = self.status.lock();
                status.last_save_time = now;
                status.flush_count += 1;
                info!(
                    "Flushed {} samples across {} channels ({} timestamps)",
                    written, channels, timestamps
                );
                Ok(written)
            }
            Err(e) => {
                error!("Flush failed, keeping {} rows buffered: {}", rows, e);
                self.record_failure(&e);
                Err(e)
            }
        }
    }

    fn record_failure(&self, e: &StorageError) {
        let mut status = self.status.lock();
        status.flush_failures += 1;
        status.last_flush_error = Some(e.to_string());
    }

    /// Write one drained batch into `store` as a single commit. Channel
    /// lengths only advance if the whole commit succeeds; on failure the
    /// staged frames are rolled back. Settling or restoring the batch in
    /// the buffers is left to the caller.
    pub async fn commit(
        &self,
        store: &mut dyn StorageBackend,
        batch: &DrainedBatch,
    ) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut staged = Vec::new();

        for (name, rows) in batch.iter() {
            let staged_ok = match self.registry.describe(name) {
                Ok(descriptor) => store.stage(descriptor, rows).await,
                Err(e) => Err(e),
            };
            if let Err(source) = staged_ok {
                return Err(self.abort(store, name, staged, source).await);
            }
            debug!("Staged {} rows for {}", rows.rows, name);
            staged.push(name.to_string());
        }

        if let Err(source) = store.commit_staged().await {
            return Err(self.abort(store, "<commit>", staged, source).await);
        }

        Ok(batch.sample_count())
    }

    async fn abort(
        &self,
        store: &mut dyn StorageBackend,
        failed: &str,
        staged: Vec<String>,
        source: StorageError,
    ) -> StorageError {
        let rolled_back = match store.rollback_staged().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Rollback after failed commit did not complete: {}", e);
                false
            }
        };
        if !staged.is_empty() {
            warn!(
                "Commit aborted at {}; channels staged before the failure: {:?} (rolled back: {})",
                failed, staged, rolled_back
            );
        }
        StorageError::Commit {
            failed: failed.to_string(),
            staged,
            rolled_back,
            source: Box::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SampleValue;
    use crate::storage::{ChunkFileBackend, StoreOptions};
    use tempfile::TempDir;

    async fn open_backend(dir: &TempDir, registry: &DatasetRegistry) -> ChunkFileBackend {
        let mut backend = ChunkFileBackend::open(dir.path(), &StoreOptions::default())
            .await
            .unwrap();
        for descriptor in registry.iter() {
            backend.ensure_channel(descriptor).await.unwrap();
        }
        backend.commit_staged().await.unwrap();
        backend
    }

    fn recording_buffers(registry: Arc<DatasetRegistry>) -> BufferManager {
        let buffers = BufferManager::new(registry, 5.0);
        buffers.reset(BTreeMap::new());
        buffers.set_recording(true);
        buffers
    }

    async fn attached_engine(dir: &TempDir) -> (FlushEngine, BufferManager) {
        let registry = Arc::new(DatasetRegistry::builtin(4));
        let backend = open_backend(dir, &registry).await;

        let engine = FlushEngine::new(registry.clone());
        engine.attach(Box::new(backend), 0.0).await;
        (engine, recording_buffers(registry))
    }

    #[tokio::test]
    async fn test_flush_extends_each_channel_by_drained_rows() {
        let dir = TempDir::new().unwrap();
        let (engine, buffers) = attached_engine(&dir).await;

        for i in 0..9 {
            buffers
                .append("raw/ppg", &SampleValue::Vector(vec![1.0, 2.0, 3.0]), i as f64)
                .unwrap();
        }
        buffers
            .append("scores/hr", &SampleValue::Scalar(72.0), 9.0)
            .unwrap();

        let written = engine.flush(&buffers, 10.0).await.unwrap();
        assert_eq!(written, 10);

        let (lengths, size) = engine.store_snapshot().await.unwrap();
        assert_eq!(lengths["raw/ppg"], 9);
        assert_eq!(lengths["scores/hr"], 1);
        assert_eq!(lengths["timestamps"], 10);
        assert!(size > 0);

        assert_eq!(buffers.stats().saved, 10);
        assert_eq!(engine.status().last_save_time, 10.0);
        assert_eq!(engine.status().flush_count, 1);
    }

    #[tokio::test]
    async fn test_commit_grows_lengths_by_batch_rows() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(DatasetRegistry::builtin(4));
        let mut backend = open_backend(&dir, &registry).await;
        let engine = FlushEngine::new(registry.clone());
        let buffers = recording_buffers(registry);

        for round in 0..2 {
            for i in 0..(3 + round) {
                buffers
                    .append("raw/imu", &SampleValue::Vector(vec![0.1, 0.2, 9.8]), i as f64)
                    .unwrap();
            }
            buffers
                .append("scores/focus", &SampleValue::Scalar(0.7), 10.0)
                .unwrap();

            let batch = buffers.drain();
            let before = backend.channel_lengths();
            let written = engine.commit(&mut backend, &batch).await.unwrap();
            assert_eq!(written, batch.sample_count());

            let after = backend.channel_lengths();
            for (name, rows) in batch.iter() {
                assert_eq!(after[name], before[name] + rows.rows as u64, "{}", name);
            }
            assert_eq!(after["raw/eeg"], before["raw/eeg"]);
            buffers.settle(&batch);
        }

        assert_eq!(backend.channel_lengths()["raw/imu"], 7);
        assert_eq!(engine.commit(&mut backend, &buffers.drain()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_flush_is_noop() {
        let dir = TempDir::new().unwrap();
        let (engine, buffers) = attached_engine(&dir).await;

        assert_eq!(engine.flush(&buffers, 3.0).await.unwrap(), 0);
        assert_eq!(engine.status().flush_count, 0);
        assert_eq!(engine.last_save_time(), 3.0);
    }

    #[tokio::test]
    async fn test_flush_without_store_keeps_data() {
        let registry = Arc::new(DatasetRegistry::default());
        let engine = FlushEngine::new(registry.clone());
        let buffers = recording_buffers(registry);
        buffers
            .append("scores/focus", &SampleValue::Scalar(0.4), 1.0)
            .unwrap();

        assert!(engine.flush(&buffers, 2.0).await.is_err());
        assert_eq!(buffers.stats().buffered, 1);
        assert!(!engine.is_attached().await);
    }

    #[tokio::test]
    async fn test_detach_returns_store() {
        let dir = TempDir::new().unwrap();
        let (engine, _buffers) = attached_engine(&dir).await;

        let mut store = engine.detach().await.unwrap();
        store.close().await.unwrap();
        assert!(engine.detach().await.is_none());
        assert!(engine.store_snapshot().await.is_err());
    }
}
