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

// Backend factory for creating storage backends from configuration

use super::backend::BackendOpener;
use super::chunkfile::ChunkFileOpener;
use crate::config::StorageSettings;
use anyhow::{bail, Result};
use std::sync::Arc;

pub struct BackendFactory;

impl BackendFactory {
    /// Create the opener for the configured backend
    pub fn create(config: &StorageSettings) -> Result<Arc<dyn BackendOpener>> {
        match config.backend.as_str() {
            "chunkfile" => Ok(Arc::new(ChunkFileOpener)),

            unknown => bail!(
                "Unknown storage backend: '{}'. Supported: chunkfile",
                unknown
            ),
        }
    }
}
