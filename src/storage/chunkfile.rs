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

// Chunked container file backend
//
// One file per session. After an 8-byte header (`BSTC`, version, reserved)
// the file is a sequence of checksummed frames:
//
//   kind: u8 | payload_len: u32 | crc32(payload): u32 | payload
//
// DECLARE frames create a channel container, CHUNK frames extend one by up
// to `chunk_size` rows, and a COMMIT frame seals everything written since the
// previous COMMIT. Only sealed frames count; on open, anything after the
// last COMMIT is cut off.

use super::backend::{BackendOpener, StorageBackend, StoreOptions};
use crate::buffer::ChannelRows;
use crate::codec::ChunkCodec;
use crate::error::{Result, StorageError};
use crate::registry::{ChannelDescriptor, DType};
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use std::collections::BTreeMap;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

pub const DATA_FILE: &str = "session_data.bin";

const MAGIC: &[u8; 4] = b"BSTC";
const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: u64 = 8;
const FRAME_HEADER_LEN: usize = 9;

const FRAME_DECLARE: u8 = 1;
const FRAME_CHUNK: u8 = 2;
const FRAME_COMMIT: u8 = 3;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Debug, Clone)]
struct ChannelEntry {
    id: u16,
    descriptor: ChannelDescriptor,
    committed_rows: u64,
    staged_rows: u64,
    /// false until the DECLARE frame is sealed by a commit
    durable: bool,
}

#[derive(Debug)]
struct Recovered {
    channels: BTreeMap<String, ChannelEntry>,
    committed_offset: u64,
    commit_seq: u64,
}

impl Recovered {
    fn empty() -> Self {
        Self {
            channels: BTreeMap::new(),
            committed_offset: HEADER_LEN,
            commit_seq: 0,
        }
    }
}

/// Append-only chunked container file
pub struct ChunkFileBackend {
    path: PathBuf,
    file: Option<File>,
    codec: ChunkCodec,
    channels: BTreeMap<String, ChannelEntry>,
    next_id: u16,
    committed_offset: u64,
    write_offset: u64,
    staged_frames: u32,
    commit_seq: u64,
    /// A frame write failed or was interrupted; bytes past `write_offset` may exist
    torn: bool,
    /// Set when a rollback could not restore the committed offset
    dirty: bool,
}

impl ChunkFileBackend {
    /// Open the container in `session_dir`, creating it if missing and
    /// cutting off any unsealed tail left by an interrupted writer.
    pub async fn open(session_dir: &Path, options: &StoreOptions) -> Result<Self> {
        let path = session_dir.join(DATA_FILE);

        let existing = match fs::read(&path).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(StorageError::io(format!("read {}", path.display()), e)),
        };

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .await
            .map_err(|e| StorageError::io(format!("open {}", path.display()), e))?;

        let recovered = match existing {
            Some(bytes) if bytes.len() as u64 >= HEADER_LEN => {
                let recovered = recover(&bytes)?;
                let discarded = bytes.len() as u64 - recovered.committed_offset;
                if discarded > 0 {
                    warn!(
                        "Discarding {} bytes of unsealed data at the end of {}",
                        discarded,
                        path.display()
                    );
                    file.set_len(recovered.committed_offset)
                        .await
                        .map_err(|e| StorageError::io("truncate unsealed tail", e))?;
                }
                info!(
                    "Reopened container {} with {} channels (commit #{})",
                    path.display(),
                    recovered.channels.len(),
                    recovered.commit_seq
                );
                recovered
            }
            _ => {
                debug!("Creating container {}", path.display());
                let mut header = BytesMut::with_capacity(HEADER_LEN as usize);
                header.put_slice(MAGIC);
                header.put_u16_le(FORMAT_VERSION);
                header.put_u16_le(0);

                file.set_len(0)
                    .await
                    .map_err(|e| StorageError::io("reset container", e))?;
                file.write_all(&header)
                    .await
                    .map_err(|e| StorageError::io("write container header", e))?;
                file.sync_all()
                    .await
                    .map_err(|e| StorageError::io("sync container header", e))?;
                Recovered::empty()
            }
        };

        file.seek(SeekFrom::Start(recovered.committed_offset))
            .await
            .map_err(|e| StorageError::io("seek to end of container", e))?;

        let next_id = recovered
            .channels
            .values()
            .map(|c| c.id + 1)
            .max()
            .unwrap_or(0);

        Ok(Self {
            path,
            file: Some(file),
            codec: ChunkCodec::new(options.compression, options.compression_level),
            channels: recovered.channels,
            next_id,
            committed_offset: recovered.committed_offset,
            write_offset: recovered.committed_offset,
            staged_frames: 0,
            commit_seq: recovered.commit_seq,
            torn: false,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        if self.dirty {
            return Err(StorageError::StoreFormat(format!(
                "{} has an unsealed tail and must be reopened",
                self.path.display()
            )));
        }
        self.file
            .as_mut()
            .ok_or_else(|| StorageError::StoreFormat("container is closed".to_string()))
    }

    async fn write_frame(&mut self, kind: u8, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(kind, payload);
        self.file_mut()?;
        // Stays set if the write fails or is cancelled part way
        let was_torn = std::mem::replace(&mut self.torn, true);
        self.file_mut()?
            .write_all(&frame)
            .await
            .map_err(|e| StorageError::io("write frame", e))?;
        self.torn = was_torn;
        self.write_offset += frame.len() as u64;
        Ok(())
    }

    fn discard_staged(&mut self) {
        self.channels.retain(|_, entry| entry.durable);
        for entry in self.channels.values_mut() {
            entry.staged_rows = 0;
        }
        self.next_id = self
            .channels
            .values()
            .map(|c| c.id + 1)
            .max()
            .unwrap_or(0);
        self.staged_frames = 0;
    }
}

#[async_trait]
impl StorageBackend for ChunkFileBackend {
    async fn ensure_channel(&mut self, descriptor: &ChannelDescriptor) -> Result<bool> {
        if let Some(entry) = self.channels.get(&descriptor.name) {
            if entry.descriptor.dtype != descriptor.dtype || entry.descriptor.shape != descriptor.shape
            {
                return Err(StorageError::StoreFormat(format!(
                    "channel '{}' exists as {} {:?}, registry expects {} {:?}",
                    descriptor.name,
                    entry.descriptor.dtype,
                    entry.descriptor.shape,
                    descriptor.dtype,
                    descriptor.shape
                )));
            }
            debug!("Channel {} already exists, skipping", descriptor.name);
            return Ok(false);
        }

        let id = self.next_id;
        let name = descriptor.name.as_bytes();
        let mut payload = BytesMut::with_capacity(16 + name.len());
        payload.put_u16_le(id);
        payload.put_u8(descriptor.dtype.code());
        payload.put_u8(descriptor.shape.len() as u8);
        for dim in &descriptor.shape {
            payload.put_u32_le(*dim as u32);
        }
        payload.put_u32_le(descriptor.chunk_size as u32);
        payload.put_u16_le(name.len() as u16);
        payload.put_slice(name);

        self.write_frame(FRAME_DECLARE, &payload).await?;
        self.staged_frames += 1;
        self.next_id += 1;
        self.channels.insert(
            descriptor.name.clone(),
            ChannelEntry {
                id,
                descriptor: descriptor.clone(),
                committed_rows: 0,
                staged_rows: 0,
                durable: false,
            },
        );

        debug!("Declared channel {} (id {})", descriptor.name, id);
        Ok(true)
    }

    async fn stage(&mut self, descriptor: &ChannelDescriptor, rows: &ChannelRows) -> Result<()> {
        let entry = self.channels.get(&descriptor.name).ok_or_else(|| {
            StorageError::StoreFormat(format!("channel '{}' is not declared", descriptor.name))
        })?;

        let id = entry.id;
        let dtype = entry.descriptor.dtype;
        let width = entry.descriptor.row_width().max(1);
        let chunk_rows = entry.descriptor.chunk_size.max(1);
        let mut start_row = entry.committed_rows + entry.staged_rows;

        if rows.values.len() != rows.rows * width {
            return Err(StorageError::StoreFormat(format!(
                "{} values do not form {} rows of width {} for '{}'",
                rows.values.len(),
                rows.rows,
                width,
                descriptor.name
            )));
        }

        for chunk in rows.values.chunks(chunk_rows * width) {
            let chunk_len = chunk.len() / width;
            let data = self.codec.encode(dtype, chunk)?;

            let mut payload = BytesMut::with_capacity(15 + data.len());
            payload.put_u16_le(id);
            payload.put_u64_le(start_row);
            payload.put_u32_le(chunk_len as u32);
            payload.put_u8(self.codec.compression().code());
            payload.put_slice(&data);

            self.write_frame(FRAME_CHUNK, &payload).await?;
            self.staged_frames += 1;
            start_row += chunk_len as u64;
        }

        if let Some(entry) = self.channels.get_mut(&descriptor.name) {
            entry.staged_rows += rows.rows as u64;
        }
        Ok(())
    }

    async fn commit_staged(&mut self) -> Result<()> {
        if self.staged_frames == 0 {
            return Ok(());
        }

        let seq = self.commit_seq + 1;
        let mut payload = BytesMut::with_capacity(12);
        payload.put_u64_le(seq);
        payload.put_u32_le(self.staged_frames);
        self.write_frame(FRAME_COMMIT, &payload).await?;

        let file = self.file_mut()?;
        file.flush()
            .await
            .map_err(|e| StorageError::io("flush container", e))?;
        file.sync_data()
            .await
            .map_err(|e| StorageError::io("sync container", e))?;

        for entry in self.channels.values_mut() {
            entry.committed_rows += entry.staged_rows;
            entry.staged_rows = 0;
            entry.durable = true;
        }
        debug!(
            "Sealed commit #{} ({} frames, {} bytes)",
            seq,
            self.staged_frames,
            self.write_offset - self.committed_offset
        );
        self.committed_offset = self.write_offset;
        self.commit_seq = seq;
        self.staged_frames = 0;
        Ok(())
    }

    async fn rollback_staged(&mut self) -> Result<()> {
        let committed = self.committed_offset;
        let needs_truncate = self.torn || self.write_offset != committed;
        self.discard_staged();

        if !needs_truncate {
            return Ok(());
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StorageError::StoreFormat("container is closed".to_string()))?;
        // Pending writes must land before the length is cut
        let _ = file.flush().await;

        let truncated = match file.set_len(committed).await {
            Ok(()) => file.seek(SeekFrom::Start(committed)).await.map(|_| ()),
            Err(e) => Err(e),
        };

        match truncated {
            Ok(()) => {
                warn!(
                    "Rolled back {} unsealed bytes in {}",
                    self.write_offset - committed,
                    self.path.display()
                );
                self.write_offset = committed;
                self.torn = false;
                Ok(())
            }
            Err(e) => {
                self.dirty = true;
                Err(StorageError::io("roll back unsealed frames", e))
            }
        }
    }

    fn channel_len(&self, channel: &str) -> Option<u64> {
        self.channels
            .get(channel)
            .filter(|entry| entry.durable)
            .map(|entry| entry.committed_rows)
    }

    fn channel_lengths(&self) -> BTreeMap<String, u64> {
        self.channels
            .iter()
            .filter(|(_, entry)| entry.durable)
            .map(|(name, entry)| (name.clone(), entry.committed_rows))
            .collect()
    }

    async fn file_size(&self) -> Result<u64> {
        fs::metadata(&self.path)
            .await
            .map(|m| m.len())
            .map_err(|e| StorageError::io(format!("stat {}", self.path.display()), e))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .map_err(|e| StorageError::io("flush container", e))?;
            file.sync_all()
                .await
                .map_err(|e| StorageError::io("sync container", e))?;
            info!("Closed container {}", self.path.display());
        }
        Ok(())
    }

    fn backend_type(&self) -> &str {
        "chunkfile"
    }
}

/// Opener for [`ChunkFileBackend`]
#[derive(Debug, Default, Clone, Copy)]
pub struct ChunkFileOpener;

#[async_trait]
impl BackendOpener for ChunkFileOpener {
    async fn open(
        &self,
        session_dir: &Path,
        options: &StoreOptions,
    ) -> Result<Box<dyn StorageBackend>> {
        Ok(Box::new(ChunkFileBackend::open(session_dir, options).await?))
    }

    fn data_file_name(&self) -> &str {
        DATA_FILE
    }
}

fn encode_frame(kind: u8, payload: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.put_u8(kind);
    frame.put_u32_le(payload.len() as u32);
    frame.put_u32_le(CRC32.checksum(payload));
    frame.put_slice(payload);
    frame
}

/// Next intact frame at `offset`: kind, payload and the offset after it
fn read_frame(bytes: &[u8], offset: usize) -> Option<(u8, &[u8], usize)> {
    let mut header = bytes.get(offset..offset.checked_add(FRAME_HEADER_LEN)?)?;
    let kind = header.get_u8();
    let len = header.get_u32_le() as usize;
    let crc = header.get_u32_le();

    let start = offset + FRAME_HEADER_LEN;
    let end = start.checked_add(len)?;
    let payload = bytes.get(start..end)?;
    if CRC32.checksum(payload) != crc {
        return None;
    }
    Some((kind, payload, end))
}

fn parse_declare(mut payload: &[u8]) -> Option<ChannelEntry> {
    if payload.remaining() < 4 {
        return None;
    }
    let id = payload.get_u16_le();
    let dtype = DType::from_code(payload.get_u8())?;
    let rank = payload.get_u8() as usize;
    if payload.remaining() < rank * 4 + 6 {
        return None;
    }
    let shape = (0..rank).map(|_| payload.get_u32_le() as usize).collect();
    let chunk_size = payload.get_u32_le() as usize;
    let name_len = payload.get_u16_le() as usize;
    if payload.remaining() != name_len {
        return None;
    }
    let name = String::from_utf8(payload.to_vec()).ok()?;

    Some(ChannelEntry {
        id,
        descriptor: ChannelDescriptor {
            name,
            shape,
            dtype,
            chunk_size,
        },
        committed_rows: 0,
        staged_rows: 0,
        durable: true,
    })
}

/// Replay sealed frames. Stops at the first frame that is torn, fails its
/// checksum or is inconsistent with what came before.
fn recover(bytes: &[u8]) -> Result<Recovered> {
    let mut header = &bytes[..HEADER_LEN as usize];
    if &header[..4] != MAGIC {
        return Err(StorageError::StoreFormat(
            "not a session container (bad magic)".to_string(),
        ));
    }
    header.advance(4);
    let version = header.get_u16_le();
    if version != FORMAT_VERSION {
        return Err(StorageError::StoreFormat(format!(
            "unsupported container version {}",
            version
        )));
    }

    let mut recovered = Recovered::empty();
    let mut names_by_id: BTreeMap<u16, String> = BTreeMap::new();
    let mut pending_declares: Vec<ChannelEntry> = Vec::new();
    let mut pending_rows: BTreeMap<u16, u64> = BTreeMap::new();
    let mut offset = HEADER_LEN as usize;

    while let Some((kind, mut payload, next)) = read_frame(bytes, offset) {
        match kind {
            FRAME_DECLARE => {
                let Some(entry) = parse_declare(payload) else {
                    break;
                };
                let clash = names_by_id.contains_key(&entry.id)
                    || recovered.channels.contains_key(&entry.descriptor.name)
                    || pending_declares.iter().any(|p| {
                        p.id == entry.id || p.descriptor.name == entry.descriptor.name
                    });
                if clash {
                    break;
                }
                pending_declares.push(entry);
            }
            FRAME_CHUNK => {
                if payload.remaining() < 15 {
                    break;
                }
                let id = payload.get_u16_le();
                let start_row = payload.get_u64_le();
                let rows = payload.get_u32_le() as u64;

                let committed = match names_by_id.get(&id) {
                    Some(name) => recovered.channels[name].committed_rows,
                    None if pending_declares.iter().any(|p| p.id == id) => 0,
                    None => break,
                };
                let pending = pending_rows.entry(id).or_default();
                if start_row != committed + *pending {
                    break;
                }
                *pending += rows;
            }
            FRAME_COMMIT => {
                if payload.remaining() < 12 {
                    break;
                }
                recovered.commit_seq = payload.get_u64_le();

                for entry in pending_declares.drain(..) {
                    names_by_id.insert(entry.id, entry.descriptor.name.clone());
                    recovered
                        .channels
                        .insert(entry.descriptor.name.clone(), entry);
                }
                for (id, rows) in std::mem::take(&mut pending_rows) {
                    if let Some(entry) = names_by_id
                        .get(&id)
                        .and_then(|name| recovered.channels.get_mut(name))
                    {
                        entry.committed_rows += rows;
                    }
                }
                recovered.committed_offset = next as u64;
            }
            _ => break,
        }
        offset = next;
    }

    Ok(recovered)
}
