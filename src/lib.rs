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

// Buffered recorder for wearable biosignal streams
//
// This is a session-oriented time-series recorder that:
// - Ingests typed samples from a device stream at a fixed cadence
// - Buffers them in memory and flushes on a time-span threshold
// - Auto-saves on a wall-clock interval independent of sample volume
// - Appends to a chunked, checksummed container file with atomic commits
// - Writes session and device metadata next to the data

pub mod autosave;
pub mod buffer;
pub mod clock;
pub mod codec;
pub mod collector;
pub mod config;
pub mod control;
pub mod device;
pub mod error;
pub mod flush;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod storage;

// Re-export main types
pub use buffer::{BufferManager, BufferStats, DrainedBatch};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{ChunkCodec, CompressionType};
pub use collector::{Collector, CollectorStats, RecordingSummary};
pub use config::{load_config, load_config_with_env, RecorderConfig};
pub use control::ControlInterface;
pub use device::{DeviceStream, RawStream, ScoreValue, SyntheticDevice};
pub use error::{Result, StorageError};
pub use flush::{FlushEngine, FlushStatus};
pub use protocol::{RecorderCommand, RecorderRequest, RecorderResponse};
pub use registry::{ChannelDescriptor, DType, DatasetRegistry, SampleValue};
pub use session::{SessionState, SessionStats, SessionSummary, StorageEngine};
pub use storage::{BackendFactory, BackendOpener, StorageBackend};
