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

// Session lifecycle: Idle -> Initializing -> Active -> Stopping -> Finalized

use chrono::{Local, TimeZone};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::autosave::AutoSaveScheduler;
use crate::buffer::BufferManager;
use crate::clock::{Clock, SystemClock};
use crate::codec::CompressionType;
use crate::config::{IngestionConfig, RecorderConfig, StorageSettings};
use crate::error::{Result, StorageError};
use crate::flush::FlushEngine;
use crate::registry::{DatasetRegistry, SampleValue, TIMESTAMPS};
use crate::storage::{BackendFactory, BackendOpener, ChunkFileOpener, StorageBackend};

pub const SESSION_INFO_FILE: &str = "session_info.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Initializing,
    Active,
    Stopping,
    Finalized,
}

/// Session metadata written to `session_info.json` at finalize
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub start_time: f64,
    pub end_time: f64,
    pub duration_seconds: f64,
    pub data_stats: DataStats,
    pub files: SessionFiles,
    pub buffer_config: BufferConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataStats {
    /// Rows across all channels except `timestamps`
    pub total_samples: u64,
    pub file_size_mb: f64,
    pub datasets: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionFiles {
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferConfig {
    pub buffer_size_minutes: f64,
    pub auto_save_interval: u64,
    pub compression: CompressionType,
    pub compression_level: u32,
}

/// Live view of the current session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    /// "recording" while Active, "not_recording" otherwise
    pub status: String,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub duration_seconds: f64,
    pub saved_samples: u64,
    pub buffered_samples: u64,
    pub total_samples: u64,
    pub last_save_time: f64,
    pub time_since_save: f64,
    pub flush_failures: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_flush_error: Option<String>,
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    session_id: Option<String>,
    session_dir: Option<PathBuf>,
    start_time: f64,
    last_summary: Option<SessionSummary>,
}

/// Buffered storage engine for one session at a time.
///
/// Lifecycle transitions are serialized by an async lock; `append` never
/// takes it and only contends on the buffer lock.
pub struct StorageEngine {
    settings: StorageSettings,
    registry: Arc<DatasetRegistry>,
    opener: Arc<dyn BackendOpener>,
    clock: Arc<dyn Clock>,
    buffers: Arc<BufferManager>,
    flush: Arc<FlushEngine>,
    autosave: AsyncMutex<AutoSaveScheduler>,
    join_timeout: Duration,
    lifecycle: AsyncMutex<()>,
    session: Mutex<SessionInner>,
}

impl StorageEngine {
    pub fn new(settings: StorageSettings, registry: Arc<DatasetRegistry>) -> Self {
        let timing = IngestionConfig::default();
        let buffers = Arc::new(BufferManager::new(
            registry.clone(),
            settings.buffer_size_minutes,
        ));
        let flush = Arc::new(FlushEngine::new(registry.clone()));
        let autosave = AutoSaveScheduler::new(settings.auto_save_period(), timing.auto_save_tick());

        Self {
            settings,
            registry,
            opener: Arc::new(ChunkFileOpener),
            clock: Arc::new(SystemClock),
            buffers,
            flush,
            autosave: AsyncMutex::new(autosave),
            join_timeout: timing.join_timeout(),
            lifecycle: AsyncMutex::new(()),
            session: Mutex::new(SessionInner {
                state: SessionState::Idle,
                session_id: None,
                session_dir: None,
                start_time: 0.0,
                last_summary: None,
            }),
        }
    }

    /// Build an engine from a loaded configuration
    pub fn from_config(config: &RecorderConfig) -> anyhow::Result<Self> {
        let registry = DatasetRegistry::from_config(&config.channels, config.storage.chunk_size)
            .map_err(|e| anyhow::anyhow!("Invalid channel catalog: {}", e))?;
        let opener = BackendFactory::create(&config.storage)?;

        Ok(Self::new(config.storage.clone(), Arc::new(registry))
            .with_opener(opener)
            .with_timing(&config.ingestion))
    }

    pub fn with_opener(mut self, opener: Arc<dyn BackendOpener>) -> Self {
        self.opener = opener;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_timing(mut self, timing: &IngestionConfig) -> Self {
        self.autosave = AsyncMutex::new(AutoSaveScheduler::new(
            self.settings.auto_save_period(),
            timing.auto_save_tick(),
        ));
        self.join_timeout = timing.join_timeout();
        self
    }

    pub fn registry(&self) -> &Arc<DatasetRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &StorageSettings {
        &self.settings
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn state(&self) -> SessionState {
        self.session.lock().state
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.lock().session_id.clone()
    }

    pub fn session_dir(&self) -> Option<PathBuf> {
        self.session.lock().session_dir.clone()
    }

    pub fn is_recording(&self) -> bool {
        self.buffers.is_recording()
    }

    /// Summary of the most recently finalized session
    pub fn last_summary(&self) -> Option<SessionSummary> {
        self.session.lock().last_summary.clone()
    }

    /// Open (or reopen) a session and start recording. Returns the session id.
    ///
    /// Existing channel data of a reopened session is kept. On failure no
    /// session is active and a directory created by this call is removed.
    pub async fn initialize_session(&self, session_id: Option<String>) -> Result<String> {
        let _lifecycle = self.lifecycle.lock().await;

        {
            let mut session = self.session.lock();
            match session.state {
                SessionState::Initializing | SessionState::Active | SessionState::Stopping => {
                    return Err(StorageError::SessionActive(
                        session.session_id.clone().unwrap_or_default(),
                    ));
                }
                SessionState::Idle | SessionState::Finalized => {}
            }
            session.state = SessionState::Initializing;
        }

        let now = self.clock.now();
        let (id, dir, backend) = match self.open_session(session_id, now).await {
            Ok(opened) => opened,
            Err(e) => {
                self.session.lock().state = SessionState::Idle;
                error!("Failed to initialize session: {}", e);
                return Err(match e {
                    StorageError::InitializationFailure(_) => e,
                    other => StorageError::InitializationFailure(other.to_string()),
                });
            }
        };

        self.buffers.reset(backend.channel_lengths());
        self.flush.attach(backend, now).await;
        self.autosave.lock().await.start(
            self.flush.clone(),
            self.buffers.clone(),
            self.clock.clone(),
        );
        self.buffers.set_recording(true);

        {
            let mut session = self.session.lock();
            session.state = SessionState::Active;
            session.session_id = Some(id.clone());
            session.session_dir = Some(dir.clone());
            session.start_time = now;
        }

        info!("Session {} initialized at {}", id, dir.display());
        Ok(id)
    }

    async fn open_session(
        &self,
        requested: Option<String>,
        now: f64,
    ) -> Result<(String, PathBuf, Box<dyn StorageBackend>)> {
        let id = match requested {
            Some(id) => {
                validate_session_id(&id)?;
                id
            }
            None => self.generate_session_id(now),
        };

        let dir = self.settings.data_dir.join(&id);
        let created = !dir.exists();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::io(format!("create {}", dir.display()), e))?;

        match self.open_store(&dir).await {
            Ok(backend) => Ok((id, dir, backend)),
            Err(e) => {
                if created {
                    if let Err(cleanup) = tokio::fs::remove_dir_all(&dir).await {
                        warn!("Could not remove {}: {}", dir.display(), cleanup);
                    }
                }
                Err(e)
            }
        }
    }

    async fn open_store(&self, dir: &Path) -> Result<Box<dyn StorageBackend>> {
        let mut backend = self
            .opener
            .open(dir, &self.settings.store_options())
            .await?;

        let declared = async {
            let mut created = 0;
            for descriptor in self.registry.iter() {
                if backend.ensure_channel(descriptor).await? {
                    created += 1;
                }
            }
            backend.commit_staged().await?;
            Ok::<_, StorageError>(created)
        }
        .await;

        match declared {
            Ok(created) => {
                debug!(
                    "Created {} channels, {} already present",
                    created,
                    self.registry.len() - created
                );
                Ok(backend)
            }
            Err(e) => {
                let _ = backend.rollback_staged().await;
                let _ = backend.close().await;
                Err(e)
            }
        }
    }

    fn generate_session_id(&self, now: f64) -> String {
        let base = Local
            .timestamp_opt(now.floor() as i64, 0)
            .single()
            .unwrap_or_else(Local::now)
            .format("%Y%m%d_%H%M%S")
            .to_string();

        if self.settings.data_dir.join(&base).exists() {
            let suffix = Uuid::new_v4().simple().to_string();
            format!("{}_{}", base, &suffix[..8])
        } else {
            base
        }
    }

    /// Buffer one sample; `timestamp` defaults to the current clock time.
    /// Triggers a flush before returning once the buffered span reaches
    /// `buffer_size_minutes`.
    pub async fn append(
        &self,
        channel: &str,
        value: SampleValue,
        timestamp: Option<f64>,
    ) -> Result<()> {
        let timestamp = timestamp.unwrap_or_else(|| self.clock.now());

        let flush_due = match self.buffers.append(channel, &value, timestamp) {
            Ok(due) => due,
            Err(e) => {
                debug!("Rejected sample for {}: {}", channel, e);
                return Err(e);
            }
        };

        if flush_due {
            debug!(
                "Buffered span {:.1}s reached threshold, flushing",
                self.buffers.pending_duration()
            );
            // The sample is buffered either way; failures show up in the stats
            if let Err(e) = self.flush.flush(&self.buffers, self.clock.now()).await {
                warn!("Threshold flush failed: {}", e);
            }
        }
        Ok(())
    }

    /// Flush now, regardless of thresholds
    pub async fn flush(&self) -> Result<usize> {
        if self.state() != SessionState::Active {
            return Err(StorageError::NotRecording);
        }
        self.flush.flush(&self.buffers, self.clock.now()).await
    }

    /// Stop accepting samples, stop auto-save and flush what is left.
    /// Returns the number of samples written by the final flush.
    pub async fn stop_recording(&self) -> Result<usize> {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_locked().await
    }

    async fn stop_locked(&self) -> Result<usize> {
        {
            let mut session = self.session.lock();
            if session.state != SessionState::Active {
                return Err(StorageError::NotRecording);
            }
            session.state = SessionState::Stopping;
        }

        self.buffers.set_recording(false);

        if !self.autosave.lock().await.stop(self.join_timeout).await {
            warn!("Auto-save did not stop cleanly; continuing shutdown");
        }

        match self.flush.flush(&self.buffers, self.clock.now()).await {
            Ok(written) => {
                info!("Recording stopped, final flush wrote {} samples", written);
                Ok(written)
            }
            Err(e) => {
                error!("Final flush failed: {}", e);
                Err(e)
            }
        }
    }

    /// Stop if needed, close the store and write `session_info.json`
    pub async fn finalize_session(&self) -> Result<SessionSummary> {
        let _lifecycle = self.lifecycle.lock().await;

        let state = self.state();
        match state {
            SessionState::Idle | SessionState::Initializing => {
                return Err(StorageError::NotRecording);
            }
            SessionState::Finalized => {
                return Err(StorageError::AlreadyFinalized(
                    self.session_id().unwrap_or_default(),
                ));
            }
            SessionState::Active => {
                if let Err(e) = self.stop_locked().await {
                    warn!("Stopping before finalize reported: {}", e);
                }
            }
            SessionState::Stopping => {}
        }

        // One more attempt for data a failed stop flush put back
        let pending = self.buffers.stats().buffered;
        if pending > 0 {
            if let Err(e) = self.flush.flush(&self.buffers, self.clock.now()).await {
                error!("{} buffered samples could not be saved: {}", pending, e);
            }
        }

        let end_time = self.clock.now();
        let (lengths, file_size) = match self.flush.store_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Store statistics unavailable, using flush counters: {}", e);
                (self.buffers.saved_lengths(), 0)
            }
        };

        if let Some(mut store) = self.flush.detach().await {
            if let Err(e) = store.close().await {
                error!("Error closing store: {}", e);
            }
        }

        let datasets: BTreeMap<String, u64> = lengths
            .into_iter()
            .filter(|(name, _)| self.registry.contains(name))
            .collect();
        let total_samples = datasets
            .iter()
            .filter(|(name, _)| name.as_str() != TIMESTAMPS)
            .map(|(_, rows)| *rows)
            .sum();

        let (session_id, session_dir, start_time) = {
            let session = self.session.lock();
            (
                session.session_id.clone().unwrap_or_default(),
                session.session_dir.clone(),
                session.start_time,
            )
        };

        let summary = SessionSummary {
            session_id,
            start_time,
            end_time,
            duration_seconds: end_time - start_time,
            data_stats: DataStats {
                total_samples,
                file_size_mb: file_size as f64 / (1024.0 * 1024.0),
                datasets,
            },
            files: SessionFiles {
                data: self.opener.data_file_name().to_string(),
            },
            buffer_config: BufferConfig {
                buffer_size_minutes: self.settings.buffer_size_minutes,
                auto_save_interval: self.settings.auto_save_interval,
                compression: self.settings.compression,
                compression_level: self.settings.compression_level,
            },
        };

        {
            let mut session = self.session.lock();
            session.state = SessionState::Finalized;
            session.last_summary = Some(summary.clone());
        }

        if let Some(dir) = session_dir {
            let path = dir.join(SESSION_INFO_FILE);
            let json = serde_json::to_vec_pretty(&summary).map_err(|e| {
                StorageError::io("serialize session metadata", std::io::Error::other(e))
            })?;
            tokio::fs::write(&path, json)
                .await
                .map_err(|e| StorageError::io(format!("write {}", path.display()), e))?;
        }

        info!("Session finalized: {}", summary.session_id);
        info!(
            "Duration: {:.1}s, Samples: {}, Size: {:.1}MB",
            summary.duration_seconds, summary.data_stats.total_samples, summary.data_stats.file_size_mb
        );
        Ok(summary)
    }

    pub fn get_session_stats(&self) -> SessionStats {
        let now = self.clock.now();
        let (state, session_id, start_time) = {
            let session = self.session.lock();
            (session.state, session.session_id.clone(), session.start_time)
        };
        let buffers = self.buffers.stats();
        let flush = self.flush.status();

        let live = matches!(state, SessionState::Active | SessionState::Stopping);
        SessionStats {
            status: if state == SessionState::Active {
                "recording".to_string()
            } else {
                "not_recording".to_string()
            },
            state,
            session_id,
            duration_seconds: if live { now - start_time } else { 0.0 },
            saved_samples: buffers.saved,
            buffered_samples: buffers.buffered,
            total_samples: buffers.saved + buffers.buffered,
            last_save_time: flush.last_save_time,
            time_since_save: if live { now - flush.last_save_time } else { 0.0 },
            flush_failures: flush.flush_failures,
            last_flush_error: flush.last_flush_error,
        }
    }

    /// Finalize whatever is open. Used on process exit.
    pub async fn shutdown(&self) -> Result<Option<SessionSummary>> {
        match self.state() {
            SessionState::Active | SessionState::Stopping => {
                self.finalize_session().await.map(Some)
            }
            _ => Ok(None),
        }
    }
}

fn validate_session_id(id: &str) -> Result<()> {
    let invalid = id.is_empty()
        || id == "."
        || id == ".."
        || id.contains(['/', '\\'])
        || id.chars().any(char::is_control);
    if invalid {
        return Err(StorageError::InitializationFailure(format!(
            "invalid session id '{}'",
            id
        )));
    }
    Ok(())
}
