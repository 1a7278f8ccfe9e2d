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

// Error taxonomy for the storage engine

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Operation requires an active recording session
    #[error("not recording")]
    NotRecording,

    #[error("unknown channel '{0}'")]
    UnknownChannel(String),

    #[error("shape mismatch for '{channel}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        channel: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("store I/O error: {context}")]
    StoreIo {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The container file exists but its contents cannot be interpreted
    #[error("invalid container: {0}")]
    StoreFormat(String),

    #[error("session initialization failed: {0}")]
    InitializationFailure(String),

    #[error("session '{0}' already finalized")]
    AlreadyFinalized(String),

    #[error("session '{0}' is still open")]
    SessionActive(String),

    /// A commit failed part-way through. `staged` lists channels whose frames
    /// were written before `failed`; `rolled_back` reports whether the file
    /// was restored to the last committed offset.
    #[error("commit failed on channel '{failed}' (staged: {staged:?}, rolled back: {rolled_back}): {source}")]
    Commit {
        failed: String,
        staged: Vec<String>,
        rolled_back: bool,
        #[source]
        source: Box<StorageError>,
    },
}

impl StorageError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        StorageError::StoreIo {
            context: context.into(),
            source,
        }
    }

    /// Validation failures are per-sample and never fatal to ingestion
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            StorageError::UnknownChannel(_) | StorageError::ShapeMismatch { .. }
        )
    }
}
