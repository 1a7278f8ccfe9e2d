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

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::buffer::BufferManager;
use crate::clock::Clock;
use crate::flush::FlushEngine;

/// Background task that flushes once `interval` has passed since the last
/// successful flush, whatever the ingestion rate.
pub struct AutoSaveScheduler {
    interval: Duration,
    tick: Duration,
    running: Option<(watch::Sender<bool>, JoinHandle<()>)>,
}

impl AutoSaveScheduler {
    pub fn new(interval: Duration, tick: Duration) -> Self {
        Self {
            interval,
            tick,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .map(|(_, handle)| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Spawn the task. Returns `false` if one is already running.
    pub fn start(
        &mut self,
        flush: Arc<FlushEngine>,
        buffers: Arc<BufferManager>,
        clock: Arc<dyn Clock>,
    ) -> bool {
        if self.is_running() {
            warn!("Auto-save already running");
            return false;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(
            flush,
            buffers,
            clock,
            self.interval.as_secs_f64(),
            self.tick,
            stop_rx,
        ));
        self.running = Some((stop_tx, handle));

        info!(
            "Auto-save started (interval {:?}, tick {:?})",
            self.interval, self.tick
        );
        true
    }

    /// Signal the task and wait up to `join_timeout`. A task that does not
    /// stop in time is aborted; returns `false` in that case.
    pub async fn stop(&mut self, join_timeout: Duration) -> bool {
        let Some((stop_tx, mut handle)) = self.running.take() else {
            return true;
        };

        let _ = stop_tx.send(true);

        match tokio::time::timeout(join_timeout, &mut handle).await {
            Ok(Ok(())) => {
                debug!("Auto-save stopped");
                true
            }
            Ok(Err(e)) => {
                warn!("Auto-save task ended abnormally: {}", e);
                true
            }
            Err(_) => {
                warn!(
                    "Auto-save did not stop within {:?}, aborting it",
                    join_timeout
                );
                handle.abort();
                false
            }
        }
    }
}

async fn run_loop(
    flush: Arc<FlushEngine>,
    buffers: Arc<BufferManager>,
    clock: Arc<dyn Clock>,
    interval_secs: f64,
    tick: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(tick) => {}
        }
        if *stop_rx.borrow() {
            break;
        }

        let now = clock.now();
        if now - flush.last_save_time() < interval_secs {
            continue;
        }

        match flush.flush(&buffers, now).await {
            Ok(0) => debug!("Auto-save: nothing buffered"),
            Ok(written) => info!("Auto-save flushed {} samples", written),
            // Recorded in the flush status; retried next tick
            Err(e) => warn!("Auto-save failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::registry::DatasetRegistry;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_single_instance() {
        let registry = Arc::new(DatasetRegistry::default());
        let flush = Arc::new(FlushEngine::new(registry.clone()));
        let buffers = Arc::new(BufferManager::new(registry, 5.0));
        buffers.reset(BTreeMap::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let mut scheduler = AutoSaveScheduler::new(Duration::from_secs(60), Duration::from_millis(10));
        assert!(scheduler.start(flush.clone(), buffers.clone(), clock.clone()));
        assert!(!scheduler.start(flush, buffers, clock));
        assert!(scheduler.is_running());

        assert!(scheduler.stop(Duration::from_secs(1)).await);
        assert!(!scheduler.is_running());
        // Stopping twice is harmless
        assert!(scheduler.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_stop_wakes_long_tick() {
        let registry = Arc::new(DatasetRegistry::default());
        let flush = Arc::new(FlushEngine::new(registry.clone()));
        let buffers = Arc::new(BufferManager::new(registry, 5.0));
        buffers.reset(BTreeMap::new());

        let mut scheduler = AutoSaveScheduler::new(Duration::from_secs(1), Duration::from_secs(3600));
        scheduler.start(flush, buffers, Arc::new(SystemClock));

        let started = std::time::Instant::now();
        assert!(scheduler.stop(Duration::from_secs(2)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
