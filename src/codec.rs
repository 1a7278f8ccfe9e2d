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

/// Chunk payload codec
///
/// Converts buffered `f64` rows into the channel's element type and applies
/// the session's compression before the bytes are framed into the container
/// file.
///
/// # Payload layout
///
/// Row-major little-endian elements: `rows * row_width * dtype.width()` bytes
/// before compression.
///
/// # Compression
///
/// - gzip: default, matches the level semantics (0-9) of the configuration
/// - zstd: better ratio at similar speed
/// - lz4: fastest, moderate ratio
/// - none: raw elements
///
use bytes::{BufMut, BytesMut};
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::str::FromStr;
use tracing::debug;

use crate::error::{Result, StorageError};
use crate::registry::DType;

/// Compression applied to chunk payloads
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    #[default]
    Gzip,
    Zstd,
    Lz4,
}

impl CompressionType {
    pub fn code(self) -> u8 {
        match self {
            CompressionType::None => 0,
            CompressionType::Gzip => 1,
            CompressionType::Zstd => 2,
            CompressionType::Lz4 => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Gzip),
            2 => Some(CompressionType::Zstd),
            3 => Some(CompressionType::Lz4),
            _ => None,
        }
    }
}

impl FromStr for CompressionType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(CompressionType::None),
            "gzip" => Ok(CompressionType::Gzip),
            "zstd" => Ok(CompressionType::Zstd),
            "lz4" => Ok(CompressionType::Lz4),
            other => Err(format!(
                "unknown compression '{}'. Supported: gzip, zstd, lz4, none",
                other
            )),
        }
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompressionType::None => "none",
            CompressionType::Gzip => "gzip",
            CompressionType::Zstd => "zstd",
            CompressionType::Lz4 => "lz4",
        };
        f.write_str(name)
    }
}

/// Encoder for chunk payloads
///
/// # Examples
///
/// ```
/// use biosignal_recorder::codec::{ChunkCodec, CompressionType};
/// use biosignal_recorder::registry::DType;
///
/// let codec = ChunkCodec::new(CompressionType::None, 0);
/// let bytes = codec.encode(DType::Int16, &[1.0, 2.0]).unwrap();
/// assert_eq!(bytes, vec![1, 0, 2, 0]);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ChunkCodec {
    compression: CompressionType,
    level: u32,
}

impl ChunkCodec {
    /// `level` is on the 0-9 scale and mapped onto each algorithm's range
    pub fn new(compression: CompressionType, level: u32) -> Self {
        Self {
            compression,
            level: level.min(9),
        }
    }

    pub fn compression(&self) -> CompressionType {
        self.compression
    }

    /// Convert values to `dtype` and compress them
    pub fn encode(&self, dtype: DType, values: &[f64]) -> Result<Vec<u8>> {
        let mut raw = BytesMut::with_capacity(values.len() * dtype.width());
        encode_elements(dtype, values, &mut raw);
        let uncompressed_size = raw.len();

        let compressed = self.compress(raw.to_vec())?;

        debug!(
            "Encoded {} {} elements: {} -> {} bytes ({})",
            values.len(),
            dtype,
            uncompressed_size,
            compressed.len(),
            self.compression
        );

        Ok(compressed)
    }

    fn compress(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        match self.compression {
            CompressionType::None => Ok(data),
            CompressionType::Gzip => self.compress_gzip(&data),
            CompressionType::Zstd => self.compress_zstd(&data),
            CompressionType::Lz4 => self.compress_lz4(&data),
        }
    }

    fn compress_gzip(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::new(self.level));
        encoder
            .write_all(data)
            .map_err(|e| StorageError::io("gzip compression", e))?;
        encoder
            .finish()
            .map_err(|e| StorageError::io("gzip compression", e))
    }

    fn compress_zstd(&self, data: &[u8]) -> Result<Vec<u8>> {
        // zstd levels start at 1; 9 is still on the fast side of its range
        let level = self.level.max(1) as i32;
        zstd::encode_all(data, level).map_err(|e| StorageError::io("zstd compression", e))
    }

    fn compress_lz4(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = lz4::EncoderBuilder::new()
            .level(self.level)
            .build(Vec::new())
            .map_err(|e| StorageError::io("lz4 encoder", e))?;

        encoder
            .write_all(data)
            .map_err(|e| StorageError::io("lz4 compression", e))?;

        let (compressed, result) = encoder.finish();
        result.map_err(|e| StorageError::io("lz4 compression", e))?;

        Ok(compressed)
    }
}

fn encode_elements(dtype: DType, values: &[f64], buf: &mut BytesMut) {
    for &v in values {
        match dtype {
            DType::Int8 => buf.put_i8(v as i8),
            DType::Int16 => buf.put_i16_le(v as i16),
            DType::Int32 => buf.put_i32_le(v as i32),
            DType::Float32 => buf.put_f32_le(v as f32),
            DType::Float64 => buf.put_f64_le(v),
        }
    }
}
