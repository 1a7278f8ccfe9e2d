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

use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info};

use crate::collector::Collector;
use crate::protocol::{RecorderCommand, RecorderRequest, RecorderResponse};

/// Control interface speaking line-delimited JSON: one request per line in,
/// one response per line out.
pub struct ControlInterface {
    collector: Arc<Collector>,
}

impl ControlInterface {
    pub fn new(collector: Arc<Collector>) -> Self {
        Self { collector }
    }

    /// Serve requests until the reader reaches EOF
    pub async fn run<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!("Control interface listening");
        let mut lines = reader.lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            let response = self.handle_line(&line).await;
            let mut bytes = serde_json::to_vec(&response)?;
            bytes.push(b'\n');
            writer.write_all(&bytes).await?;
            writer.flush().await?;
        }

        info!("Control input closed");
        Ok(())
    }

    pub async fn handle_line(&self, line: &str) -> RecorderResponse {
        match serde_json::from_str::<RecorderRequest>(line) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                error!("Invalid control request: {}", e);
                RecorderResponse::error(format!("Invalid request: {}", e))
            }
        }
    }

    pub async fn handle(&self, request: RecorderRequest) -> RecorderResponse {
        debug!("Processing command: {:?}", request.command);

        match request.command {
            RecorderCommand::Start => {
                match self.collector.start_recording(request.session_id).await {
                    Ok(id) => RecorderResponse::success("Recording started", Some(id)),
                    Err(e) => RecorderResponse::error(e.to_string()),
                }
            }

            RecorderCommand::Stop => match self.collector.stop_ingestion().await {
                Ok(written) => RecorderResponse::success(
                    format!("Recording stopped, {} samples flushed", written),
                    self.collector.engine().session_id(),
                ),
                Err(e) => RecorderResponse::error(e.to_string()),
            },

            RecorderCommand::Finalize => {
                if self.collector.has_session() {
                    match self.collector.stop_recording().await {
                        Ok(summary) => to_data_response(
                            "Session finalized",
                            Some(summary.session_id.clone()),
                            &summary,
                        ),
                        Err(e) => RecorderResponse::error(e.to_string()),
                    }
                } else {
                    match self.collector.engine().finalize_session().await {
                        Ok(summary) => to_data_response(
                            "Session finalized",
                            Some(summary.session_id.clone()),
                            &summary,
                        ),
                        Err(e) => RecorderResponse::error(e.to_string()),
                    }
                }
            }

            RecorderCommand::Status => {
                let stats = self.collector.get_session_stats();
                to_data_response(stats.status.clone(), stats.session_id.clone(), &stats)
            }

            RecorderCommand::Append => {
                let (Some(channel), Some(value)) = (request.channel, request.value) else {
                    return RecorderResponse::error("append requires 'channel' and 'value'");
                };
                let engine = self.collector.engine();
                match engine.append(&channel, value, request.timestamp).await {
                    Ok(()) => RecorderResponse::success("Sample buffered", engine.session_id()),
                    Err(e) => RecorderResponse::error(e.to_string()),
                }
            }
        }
    }
}

fn to_data_response<T: serde::Serialize>(
    message: impl Into<String>,
    session_id: Option<String>,
    data: &T,
) -> RecorderResponse {
    match serde_json::to_value(data) {
        Ok(value) => RecorderResponse::success(message, session_id).with_data(value),
        Err(e) => RecorderResponse::error(format!("Failed to encode response: {}", e)),
    }
}
