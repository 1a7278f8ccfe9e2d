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

use serde::{Deserialize, Serialize};

use crate::registry::SampleValue;

/// Command types for recorder control
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecorderCommand {
    /// Initialize a session and start ingesting
    Start,
    /// Stop recording and flush; the session stays open until finalize
    Stop,
    /// Close the session and return its summary
    Finalize,
    Status,
    /// Append one sample (annotations and other external producers)
    Append,
}

/// One line of the control protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderRequest {
    pub command: RecorderCommand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<SampleValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

impl RecorderRequest {
    pub fn new(command: RecorderCommand) -> Self {
        Self {
            command,
            session_id: None,
            channel: None,
            value: None,
            timestamp: None,
        }
    }
}

/// Response message for recording control operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Summary or statistics, depending on the command
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RecorderResponse {
    pub fn success(message: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            session_id,
            data: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            session_id: None,
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}
