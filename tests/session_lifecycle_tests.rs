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

use async_trait::async_trait;
use biosignal_recorder::buffer::ChannelRows;
use biosignal_recorder::config::{IngestionConfig, StorageSettings};
use biosignal_recorder::storage::{ChunkFileBackend, StoreOptions};
use biosignal_recorder::{
    BackendOpener, ChannelDescriptor, DatasetRegistry, ManualClock, SampleValue, SessionState,
    StorageBackend, StorageEngine, StorageError,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn settings(dir: &TempDir) -> StorageSettings {
    StorageSettings {
        data_dir: dir.path().to_path_buf(),
        ..Default::default()
    }
}

fn create_engine(dir: &TempDir, clock: Arc<ManualClock>) -> StorageEngine {
    StorageEngine::new(settings(dir), Arc::new(DatasetRegistry::default())).with_clock(clock)
}

#[tokio::test]
async fn test_focus_scenario_summary() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(1_700_000_000.0));
    let engine = create_engine(&dir, clock.clone());

    let id = engine.initialize_session(Some("S1".to_string())).await.unwrap();
    assert_eq!(id, "S1");

    for i in 0..10 {
        clock.set(1_700_000_000.0 + i as f64);
        engine
            .append("scores/focus", SampleValue::Scalar(0.1 * i as f64), None)
            .await
            .unwrap();
    }

    let summary = engine.finalize_session().await.unwrap();
    assert_eq!(summary.session_id, "S1");
    assert_eq!(summary.data_stats.datasets["scores/focus"], 10);
    assert_eq!(summary.data_stats.datasets["timestamps"], 10);
    assert_eq!(summary.data_stats.datasets["raw/eeg"], 0);
    assert_eq!(summary.data_stats.total_samples, 10);
    assert!((summary.duration_seconds - 9.0).abs() < 1e-6);
    assert!(summary.data_stats.file_size_mb > 0.0);
}

#[tokio::test]
async fn test_session_metadata_document() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(100.0));
    let engine = create_engine(&dir, clock.clone());

    engine.initialize_session(Some("meta".to_string())).await.unwrap();
    engine
        .append("scores/hr", SampleValue::Scalar(64.0), None)
        .await
        .unwrap();
    clock.advance(30.0);
    engine.finalize_session().await.unwrap();

    let text = std::fs::read_to_string(dir.path().join("meta/session_info.json")).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&text).unwrap();

    assert_eq!(doc["session_id"], "meta");
    assert_eq!(doc["start_time"], 100.0);
    assert_eq!(doc["end_time"], 130.0);
    assert_eq!(doc["duration_seconds"], 30.0);
    assert_eq!(doc["data_stats"]["total_samples"], 1);
    assert_eq!(doc["data_stats"]["datasets"]["scores/hr"], 1);
    assert_eq!(doc["files"]["data"], "session_data.bin");
    assert_eq!(doc["buffer_config"]["buffer_size_minutes"], 5.0);
    assert_eq!(doc["buffer_config"]["auto_save_interval"], 300);
    assert_eq!(doc["buffer_config"]["compression"], "gzip");
    assert_eq!(doc["buffer_config"]["compression_level"], 4);
    assert!(dir.path().join("meta/session_data.bin").exists());
}

#[tokio::test]
async fn test_threshold_flush_before_append_returns() {
    let dir = TempDir::new().unwrap();
    let settings = StorageSettings {
        buffer_size_minutes: 1.0,
        ..settings(&dir)
    };
    let engine = StorageEngine::new(settings, Arc::new(DatasetRegistry::default()))
        .with_clock(Arc::new(ManualClock::new(0.0)));
    engine.initialize_session(Some("threshold".into())).await.unwrap();

    for t in 0..60 {
        engine
            .append("scores/poas", SampleValue::Scalar(0.5), Some(t as f64))
            .await
            .unwrap();
    }
    let stats = engine.get_session_stats();
    assert_eq!(stats.saved_samples, 0);
    assert_eq!(stats.buffered_samples, 60);

    // Span reaches exactly 60 s
    engine
        .append("scores/poas", SampleValue::Scalar(0.5), Some(60.0))
        .await
        .unwrap();
    let stats = engine.get_session_stats();
    assert_eq!(stats.saved_samples, 61);
    assert_eq!(stats.buffered_samples, 0);

    engine.finalize_session().await.unwrap();
}

#[tokio::test]
async fn test_buffered_plus_saved_counts_every_append() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(0.0));
    let engine = create_engine(&dir, clock.clone());
    engine.initialize_session(Some("counts".into())).await.unwrap();

    let mut appended = 0u64;
    for i in 0..25 {
        clock.advance(0.04);
        engine
            .append("raw/eeg", SampleValue::Vector(vec![i as f64; 7]), None)
            .await
            .unwrap();
        engine
            .append("raw/imu", SampleValue::Vector(vec![0.0, 0.0, 1.0]), None)
            .await
            .unwrap();
        appended += 2;

        if i == 12 {
            engine.flush().await.unwrap();
        }
        let stats = engine.get_session_stats();
        assert_eq!(stats.buffered_samples + stats.saved_samples, appended);
        assert_eq!(stats.total_samples, appended);
    }

    let summary = engine.finalize_session().await.unwrap();
    assert_eq!(summary.data_stats.datasets["raw/eeg"], 25);
    assert_eq!(summary.data_stats.datasets["raw/imu"], 25);
    assert_eq!(summary.data_stats.total_samples, 50);
}

#[tokio::test]
async fn test_rejected_samples_leave_buffers_unchanged() {
    let dir = TempDir::new().unwrap();
    let engine = create_engine(&dir, Arc::new(ManualClock::new(0.0)));

    let err = engine
        .append("scores/focus", SampleValue::Scalar(1.0), None)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotRecording));

    engine.initialize_session(Some("reject".into())).await.unwrap();
    engine
        .append("power_bands/alpha", SampleValue::Vector(vec![0.1; 5]), None)
        .await
        .unwrap();

    let err = engine
        .append("power_bands/alpha", SampleValue::Vector(vec![0.1; 3]), None)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::ShapeMismatch { .. }));

    let err = engine
        .append("scores/hr", SampleValue::Vector(vec![60.0]), None)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::ShapeMismatch { .. }));

    let err = engine
        .append("scores/stress", SampleValue::Scalar(1.0), None)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::UnknownChannel(_)));

    assert_eq!(engine.get_session_stats().buffered_samples, 1);

    engine.stop_recording().await.unwrap();
    let err = engine
        .append("scores/focus", SampleValue::Scalar(1.0), None)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotRecording));

    let summary = engine.finalize_session().await.unwrap();
    assert_eq!(summary.data_stats.datasets["power_bands/alpha"], 1);
}

#[tokio::test]
async fn test_reinitialize_keeps_prior_data() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(0.0));
    let engine = create_engine(&dir, clock.clone());

    engine.initialize_session(Some("resume".into())).await.unwrap();
    for i in 0..5 {
        engine
            .append("scores/spo2", SampleValue::Scalar(97.0), Some(i as f64))
            .await
            .unwrap();
    }
    engine.finalize_session().await.unwrap();

    engine.initialize_session(Some("resume".into())).await.unwrap();
    assert_eq!(engine.get_session_stats().saved_samples, 5);
    for i in 5..8 {
        engine
            .append("scores/spo2", SampleValue::Scalar(98.0), Some(i as f64))
            .await
            .unwrap();
    }

    let summary = engine.finalize_session().await.unwrap();
    assert_eq!(summary.data_stats.datasets["scores/spo2"], 8);
    assert_eq!(summary.data_stats.datasets["timestamps"], 8);
}

#[tokio::test]
async fn test_finalize_twice_reports_already_finalized() {
    let dir = TempDir::new().unwrap();
    let engine = create_engine(&dir, Arc::new(ManualClock::new(0.0)));

    engine.initialize_session(Some("twice".into())).await.unwrap();
    let summary = engine.finalize_session().await.unwrap();

    let err = engine.finalize_session().await.unwrap_err();
    assert!(matches!(err, StorageError::AlreadyFinalized(ref id) if id == "twice"));
    assert_eq!(engine.last_summary(), Some(summary));
    assert_eq!(engine.state(), SessionState::Finalized);
}

#[tokio::test]
async fn test_initialization_failure_restores_idle() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("blocked");
    std::fs::write(&blocker, b"a file, not a directory").unwrap();

    let settings = StorageSettings {
        data_dir: blocker,
        ..Default::default()
    };
    let engine = StorageEngine::new(settings, Arc::new(DatasetRegistry::default()));

    let err = engine.initialize_session(Some("x".into())).await.unwrap_err();
    assert!(matches!(err, StorageError::InitializationFailure(_)));
    assert_eq!(engine.state(), SessionState::Idle);
    assert!(!engine.is_recording());
}

struct BrokenOpener;

#[async_trait]
impl BackendOpener for BrokenOpener {
    async fn open(
        &self,
        _session_dir: &Path,
        _options: &StoreOptions,
    ) -> biosignal_recorder::Result<Box<dyn StorageBackend>> {
        Err(StorageError::StoreFormat("device busy".to_string()))
    }

    fn data_file_name(&self) -> &str {
        "broken.bin"
    }
}

#[tokio::test]
async fn test_failed_init_removes_new_session_dir() {
    let dir = TempDir::new().unwrap();
    let engine = create_engine(&dir, Arc::new(ManualClock::new(0.0)))
        .with_opener(Arc::new(BrokenOpener));

    let err = engine.initialize_session(Some("gone".into())).await.unwrap_err();
    assert!(err.to_string().contains("device busy"));
    assert!(!dir.path().join("gone").exists());
    assert_eq!(engine.state(), SessionState::Idle);
}

/// Chunk file backend that fails staging for one channel on demand and
/// can be slowed down after each staged channel
struct FlakyBackend {
    inner: ChunkFileBackend,
    fail_channel: &'static str,
    failing: Arc<AtomicBool>,
    stall: Option<Duration>,
}

#[async_trait]
impl StorageBackend for FlakyBackend {
    async fn ensure_channel(&mut self, descriptor: &ChannelDescriptor) -> biosignal_recorder::Result<bool> {
        self.inner.ensure_channel(descriptor).await
    }

    async fn stage(
        &mut self,
        descriptor: &ChannelDescriptor,
        rows: &ChannelRows,
    ) -> biosignal_recorder::Result<()> {
        if self.failing.load(Ordering::SeqCst) && descriptor.name == self.fail_channel {
            return Err(StorageError::io(
                "write chunk",
                std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            ));
        }
        self.inner.stage(descriptor, rows).await?;
        if let Some(stall) = self.stall {
            tokio::time::sleep(stall).await;
        }
        Ok(())
    }

    async fn commit_staged(&mut self) -> biosignal_recorder::Result<()> {
        self.inner.commit_staged().await
    }

    async fn rollback_staged(&mut self) -> biosignal_recorder::Result<()> {
        self.inner.rollback_staged().await
    }

    fn channel_len(&self, channel: &str) -> Option<u64> {
        self.inner.channel_len(channel)
    }

    fn channel_lengths(&self) -> BTreeMap<String, u64> {
        self.inner.channel_lengths()
    }

    async fn file_size(&self) -> biosignal_recorder::Result<u64> {
        self.inner.file_size().await
    }

    async fn close(&mut self) -> biosignal_recorder::Result<()> {
        self.inner.close().await
    }

    fn backend_type(&self) -> &str {
        "flaky"
    }
}

struct FlakyOpener {
    failing: Arc<AtomicBool>,
    stall: Option<Duration>,
}

#[async_trait]
impl BackendOpener for FlakyOpener {
    async fn open(
        &self,
        session_dir: &Path,
        options: &StoreOptions,
    ) -> biosignal_recorder::Result<Box<dyn StorageBackend>> {
        Ok(Box::new(FlakyBackend {
            inner: ChunkFileBackend::open(session_dir, options).await?,
            fail_channel: "scores/hr",
            failing: self.failing.clone(),
            stall: self.stall,
        }))
    }

    fn data_file_name(&self) -> &str {
        "session_data.bin"
    }
}

#[tokio::test]
async fn test_failed_flush_keeps_data_and_is_reported() {
    let dir = TempDir::new().unwrap();
    let failing = Arc::new(AtomicBool::new(false));
    let engine = create_engine(&dir, Arc::new(ManualClock::new(0.0))).with_opener(Arc::new(
        FlakyOpener {
            failing: failing.clone(),
            stall: None,
        },
    ));
    engine.initialize_session(Some("flaky".into())).await.unwrap();

    for i in 0..4 {
        engine
            .append("raw/ppg", SampleValue::Vector(vec![1.0, 2.0, 3.0]), Some(i as f64))
            .await
            .unwrap();
        engine
            .append("scores/hr", SampleValue::Scalar(70.0), Some(i as f64))
            .await
            .unwrap();
    }

    failing.store(true, Ordering::SeqCst);
    let err = engine.flush().await.unwrap_err();
    match &err {
        StorageError::Commit {
            failed,
            staged,
            rolled_back,
            ..
        } => {
            assert_eq!(failed, "scores/hr");
            // Channels are written in name order
            assert_eq!(staged, &vec!["raw/ppg".to_string()]);
            assert!(*rolled_back);
        }
        other => panic!("unexpected error {:?}", other),
    }

    let stats = engine.get_session_stats();
    assert_eq!(stats.saved_samples, 0);
    assert_eq!(stats.buffered_samples, 8);
    assert_eq!(stats.flush_failures, 1);
    assert!(stats.last_flush_error.unwrap().contains("scores/hr"));

    // Retried on the next flush once the store recovers
    failing.store(false, Ordering::SeqCst);
    assert_eq!(engine.flush().await.unwrap(), 8);

    let summary = engine.finalize_session().await.unwrap();
    assert_eq!(summary.data_stats.datasets["raw/ppg"], 4);
    assert_eq!(summary.data_stats.datasets["scores/hr"], 4);
    assert_eq!(summary.data_stats.datasets["timestamps"], 8);
}

#[tokio::test]
async fn test_finalize_retries_failed_stop_flush() {
    let dir = TempDir::new().unwrap();
    let failing = Arc::new(AtomicBool::new(true));
    let engine = create_engine(&dir, Arc::new(ManualClock::new(0.0))).with_opener(Arc::new(
        FlakyOpener {
            failing: failing.clone(),
            stall: None,
        },
    ));
    engine.initialize_session(Some("retry".into())).await.unwrap();
    engine
        .append("scores/hr", SampleValue::Scalar(61.0), Some(1.0))
        .await
        .unwrap();

    assert!(engine.stop_recording().await.is_err());
    assert_eq!(engine.state(), SessionState::Stopping);
    assert_eq!(engine.get_session_stats().buffered_samples, 1);

    failing.store(false, Ordering::SeqCst);
    let summary = engine.finalize_session().await.unwrap();
    assert_eq!(summary.data_stats.datasets["scores/hr"], 1);
}

#[tokio::test]
async fn test_stop_during_slow_autosave_keeps_samples() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(0.0));
    let settings = StorageSettings {
        auto_save_interval: 1,
        ..settings(&dir)
    };
    // The auto-save join gives up long before a stalled commit finishes
    let timing = IngestionConfig {
        auto_save_tick_ms: 20,
        join_timeout_ms: 100,
        ..Default::default()
    };
    let engine = StorageEngine::new(settings, Arc::new(DatasetRegistry::default()))
        .with_clock(clock.clone())
        .with_timing(&timing)
        .with_opener(Arc::new(FlakyOpener {
            failing: Arc::new(AtomicBool::new(false)),
            stall: Some(Duration::from_millis(800)),
        }));
    engine.initialize_session(Some("slow".into())).await.unwrap();

    for i in 0..3 {
        engine
            .append("scores/focus", SampleValue::Scalar(0.2), Some(i as f64))
            .await
            .unwrap();
    }
    clock.advance(2.0);
    tokio::time::sleep(Duration::from_millis(200)).await;
    // Drained by the auto-save and stuck inside the store
    let stats = engine.get_session_stats();
    assert_eq!(stats.saved_samples, 0);
    assert_eq!(stats.buffered_samples, 3);

    assert_eq!(engine.stop_recording().await.unwrap(), 3);
    let stats = engine.get_session_stats();
    assert_eq!(stats.saved_samples, 3);
    assert_eq!(stats.buffered_samples, 0);

    let summary = engine.finalize_session().await.unwrap();
    assert_eq!(summary.data_stats.datasets["scores/focus"], 3);
    assert_eq!(summary.data_stats.datasets["timestamps"], 3);
}
