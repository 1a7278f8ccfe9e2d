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

// Storage backend traits for append-only session stores

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;

use crate::buffer::ChannelRows;
use crate::codec::CompressionType;
use crate::error::Result;
use crate::registry::ChannelDescriptor;

/// Options applied when a session store is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    pub compression: CompressionType,
    pub compression_level: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            compression: CompressionType::Gzip,
            compression_level: 4,
        }
    }
}

/// An open, append-only session store holding one resizable container per
/// channel.
///
/// Writes happen in two steps: [`stage`](Self::stage) appends rows for one
/// channel, [`commit_staged`](Self::commit_staged) makes everything staged
/// durable at once. Channel lengths only ever grow, and only on commit.
///
/// Reading data back is NOT part of this trait.
#[async_trait]
pub trait StorageBackend: Send {
    /// Declare the container for a channel. Existing containers are kept
    /// untouched; returns `true` if a new one was declared. Declarations
    /// become durable with the next commit.
    async fn ensure_channel(&mut self, descriptor: &ChannelDescriptor) -> Result<bool>;

    /// Append rows for one channel to the pending commit
    async fn stage(&mut self, descriptor: &ChannelDescriptor, rows: &ChannelRows) -> Result<()>;

    /// Make all staged declarations and rows durable
    async fn commit_staged(&mut self) -> Result<()>;

    /// Drop everything staged since the last commit
    async fn rollback_staged(&mut self) -> Result<()>;

    /// Committed rows of a channel, `None` if it was never declared
    fn channel_len(&self, channel: &str) -> Option<u64>;

    /// Committed rows of every declared channel
    fn channel_lengths(&self) -> BTreeMap<String, u64>;

    /// Size of the store on disk in bytes
    async fn file_size(&self) -> Result<u64>;

    /// Flush and release the underlying handle. Safe to call twice.
    async fn close(&mut self) -> Result<()>;

    /// Get backend type identifier
    fn backend_type(&self) -> &str;
}

/// Opens the store for one session directory
#[async_trait]
pub trait BackendOpener: Send + Sync {
    async fn open(&self, session_dir: &Path, options: &StoreOptions)
        -> Result<Box<dyn StorageBackend>>;

    /// Name of the data file inside the session directory
    fn data_file_name(&self) -> &str;
}
