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

// Storage backend module
//
// Provides a trait-based abstraction over the on-disk session store so the
// flush path does not depend on the container format.
//
// This module focuses on WRITE-ONLY operations.

pub mod backend;
pub mod chunkfile;
pub mod factory;

pub use backend::{BackendOpener, StorageBackend, StoreOptions};
pub use chunkfile::{ChunkFileBackend, ChunkFileOpener, DATA_FILE};
pub use factory::BackendFactory;
