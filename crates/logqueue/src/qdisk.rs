// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! File-backed FIFO used as the disk spillover tier.
//!
//! # Layout
//!
//! ```text
//! 0            4096                                        capacity
//! | header ... | record | record | ...  ring  ... | record |
//! ```
//!
//! The first [`QDISK_RESERVED_SPACE`] bytes hold the header. Records are
//! `[u32 len][u32 crc32][payload]`, little-endian, written between the
//! reserved area and the configured capacity. A record that starts below the
//! capacity may end past it; the next write then wraps to the start of the
//! ring once the reader has freed enough room there.
//!
//! A write is accepted while the bytes used by records stay below
//! `capacity - 4096`. On a graceful stop the in-memory tiers of the owning
//! queue are appended after the ring and their positions recorded in the
//! header, so the next start restores them.

use crate::constants::{
    MAX_RECORD_SIZE, QDISK_MAGIC_NON_RELIABLE, QDISK_MAGIC_RELIABLE, QDISK_RESERVED_SPACE,
    QDISK_VERSION, QUEUE_FILE_EXTENSION, QUEUE_FILE_PREFIX, RECORD_HEADER_SIZE,
    RELIABLE_QUEUE_FILE_EXTENSION,
};
use crate::errors::QueueFileError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const HEADER_LEN: usize = 88;

/// Identifies a queue file by its sequence index.
///
/// The index is encoded in the file name (`syslog-ng-00000.qf`); `abandoned`
/// is tracked alongside it and never derived from the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueFileId {
    pub sequence: u32,
    pub abandoned: bool,
}

impl QueueFileId {
    pub fn new(sequence: u32) -> Self {
        Self {
            sequence,
            abandoned: false,
        }
    }

    pub fn file_name(&self, reliable: bool) -> String {
        let extension = if reliable {
            RELIABLE_QUEUE_FILE_EXTENSION
        } else {
            QUEUE_FILE_EXTENSION
        };
        format!("{QUEUE_FILE_PREFIX}{:05}.{extension}", self.sequence)
    }

    /// Returns the sequence index encoded in a queue file name.
    pub fn parse_sequence(file_name: &str) -> Option<u32> {
        let rest = file_name.strip_prefix(QUEUE_FILE_PREFIX)?;
        let (index, extension) = rest.split_once('.')?;
        if extension != QUEUE_FILE_EXTENSION && extension != RELIABLE_QUEUE_FILE_EXTENSION {
            return None;
        }
        if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        index.parse().ok()
    }
}

/// Next unused sequence index in `dir`.
pub fn next_sequence(dir: &Path) -> Result<u32, QueueFileError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(QueueFileError::io(dir, e)),
    };
    let mut next = 0;
    for entry in entries {
        let entry = entry.map_err(|e| QueueFileError::io(dir, e))?;
        if let Some(sequence) = entry
            .file_name()
            .to_str()
            .and_then(QueueFileId::parse_sequence)
        {
            next = next.max(sequence.saturating_add(1));
        }
    }
    Ok(next)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFileHeader {
    pub reliable: bool,
    pub version: u8,
    pub big_endian: bool,
    pub read_head: u64,
    pub write_head: u64,
    pub length: u64,
    pub used_bytes: u64,
    /// End of the last record before the ring wrapped, `0` when not wrapped.
    pub end_of_ring: u64,
    pub capacity_bytes: u64,
    pub front_cache_pos: u64,
    pub front_cache_count: u64,
    pub window_pos: u64,
    pub window_count: u64,
}

impl QueueFileHeader {
    fn new(capacity_bytes: u64, reliable: bool) -> Self {
        Self {
            reliable,
            version: QDISK_VERSION,
            big_endian: false,
            read_head: QDISK_RESERVED_SPACE,
            write_head: QDISK_RESERVED_SPACE,
            capacity_bytes,
            ..Default::default()
        }
    }

    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        let magic = if self.reliable {
            QDISK_MAGIC_RELIABLE
        } else {
            QDISK_MAGIC_NON_RELIABLE
        };
        buf[0..4].copy_from_slice(&magic);
        buf[4] = self.version;
        buf[5] = u8::from(self.big_endian);
        let fields = [
            self.read_head,
            self.write_head,
            self.length,
            self.used_bytes,
            self.end_of_ring,
            self.capacity_bytes,
            self.front_cache_pos,
            self.front_cache_count,
            self.window_pos,
            self.window_count,
        ];
        for (i, value) in fields.iter().enumerate() {
            let start = 8 + i * 8;
            buf[start..start + 8].copy_from_slice(&value.to_le_bytes());
        }
        buf
    }

    fn decode(buf: &[u8; HEADER_LEN], path: &Path) -> Result<Self, QueueFileError> {
        let reliable = match [buf[0], buf[1], buf[2], buf[3]] {
            QDISK_MAGIC_RELIABLE => true,
            QDISK_MAGIC_NON_RELIABLE => false,
            _ => return Err(QueueFileError::BadMagic(path.to_path_buf())),
        };
        let version = buf[4];
        if version != QDISK_VERSION {
            return Err(QueueFileError::UnsupportedVersion {
                path: path.to_path_buf(),
                version,
            });
        }
        let field = |i: usize| {
            let start = 8 + i * 8;
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[start..start + 8]);
            u64::from_le_bytes(bytes)
        };
        Ok(Self {
            reliable,
            version,
            big_endian: buf[5] != 0,
            read_head: field(0),
            write_head: field(1),
            length: field(2),
            used_bytes: field(3),
            end_of_ring: field(4),
            capacity_bytes: field(5),
            front_cache_pos: field(6),
            front_cache_count: field(7),
            window_pos: field(8),
            window_count: field(9),
        })
    }

    fn is_wrapped(&self) -> bool {
        self.end_of_ring != 0
    }
}

/// In-memory tiers restored from a queue file.
#[derive(Debug, Default)]
pub struct SavedTiers {
    pub front_cache: Vec<Bytes>,
    pub window: Vec<Bytes>,
}

impl SavedTiers {
    pub fn is_empty(&self) -> bool {
        self.front_cache.is_empty() && self.window.is_empty()
    }

    pub fn len(&self) -> usize {
        self.front_cache.len() + self.window.len()
    }
}

/// Summary printed by `dqtool info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueFileInfo {
    pub path: PathBuf,
    pub header: QueueFileHeader,
    pub file_len: u64,
    /// Records in the ring plus saved in-memory messages.
    pub number_of_messages: u64,
}

/// Every message of a queue file, in delivery order.
#[derive(Debug, Default)]
pub struct QueueFileContents {
    pub front_cache: Vec<Bytes>,
    pub ring: Vec<Bytes>,
    pub window: Vec<Bytes>,
}

impl QueueFileContents {
    pub fn into_messages(self) -> impl Iterator<Item = Bytes> {
        self.front_cache
            .into_iter()
            .chain(self.ring)
            .chain(self.window)
    }
}

pub struct QueueFile {
    id: QueueFileId,
    path: PathBuf,
    file: File,
    header: QueueFileHeader,
    file_len: u64,
}

impl std::fmt::Debug for QueueFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueFile")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("header", &self.header)
            .field("file_len", &self.file_len)
            .finish()
    }
}

impl QueueFile {
    /// Creates an empty queue file, replacing anything at `path`.
    pub fn create(
        path: &Path,
        id: QueueFileId,
        capacity_bytes: u64,
        reliable: bool,
        prealloc: bool,
    ) -> Result<Self, QueueFileError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).map_err(|e| QueueFileError::io(dir, e))?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| QueueFileError::io(path, e))?;
        let file_len = if prealloc {
            capacity_bytes
        } else {
            QDISK_RESERVED_SPACE
        };
        file.set_len(file_len)
            .map_err(|e| QueueFileError::io(path, e))?;

        let mut queue_file = Self {
            id,
            path: path.to_path_buf(),
            file,
            header: QueueFileHeader::new(capacity_bytes, reliable),
            file_len,
        };
        queue_file.persist()?;
        debug!(path = %path.display(), capacity_bytes, reliable, "Queue file created");
        Ok(queue_file)
    }

    /// Opens an existing queue file and takes back the in-memory tiers saved
    /// in it. A missing or zero-length file is created empty.
    pub fn open(
        path: &Path,
        id: QueueFileId,
        capacity_bytes: u64,
        reliable: bool,
        prealloc: bool,
    ) -> Result<(Self, SavedTiers), QueueFileError> {
        let len = match fs::metadata(path) {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(QueueFileError::io(path, e)),
        };
        if len == 0 {
            let created = Self::create(path, id, capacity_bytes, reliable, prealloc)?;
            return Ok((created, SavedTiers::default()));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| QueueFileError::io(path, e))?;
        let header = read_header(&mut file, path, len)?;
        if header.reliable != reliable {
            return Err(QueueFileError::BadMagic(path.to_path_buf()));
        }
        validate_header(&header, path, len)?;

        let mut queue_file = Self {
            id,
            path: path.to_path_buf(),
            file,
            header,
            file_len: len,
        };
        let saved = queue_file.take_saved_tiers()?;
        debug!(
            path = %path.display(),
            length = queue_file.header.length,
            restored = saved.len(),
            "Queue file loaded"
        );
        Ok((queue_file, saved))
    }

    pub fn id(&self) -> QueueFileId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &QueueFileHeader {
        &self.header
    }

    pub fn is_reliable(&self) -> bool {
        self.header.reliable
    }

    /// Records in the ring.
    pub fn len(&self) -> u64 {
        self.header.length
    }

    pub fn is_empty(&self) -> bool {
        self.header.length == 0
    }

    pub fn used_bytes(&self) -> u64 {
        self.header.used_bytes
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.header.capacity_bytes
    }

    /// Bytes available to records: capacity minus the reserved header area.
    pub fn max_usable_bytes(&self) -> u64 {
        self.header
            .capacity_bytes
            .saturating_sub(QDISK_RESERVED_SPACE)
    }

    pub fn has_space(&self) -> bool {
        !self.id.abandoned && self.header.used_bytes < self.max_usable_bytes()
    }

    /// `disk_allocated_bytes`: file size up to the capacity, in whole KiB.
    pub fn allocated_bytes(&self) -> u64 {
        floor_kib(self.file_len.min(self.header.capacity_bytes))
    }

    /// `disk_usage_bytes`: bytes used by records, in whole KiB.
    pub fn usage_bytes(&self) -> u64 {
        floor_kib(self.header.used_bytes).min(self.allocated_bytes())
    }

    pub fn abandon(&mut self) {
        self.id.abandoned = true;
    }

    /// Appends `payload`. Returns `Ok(false)` without writing when the file is full.
    pub fn write(&mut self, payload: &[u8]) -> Result<bool, QueueFileError> {
        if self.id.abandoned {
            return Err(QueueFileError::ReadOnly(self.path.clone()));
        }
        if self.header.length == 0 {
            self.reset_heads();
        }
        if !self.has_space() {
            return Ok(false);
        }

        let record_len = RECORD_HEADER_SIZE + payload.len() as u64;
        let header = &mut self.header;
        let offset = if header.is_wrapped() {
            if header.write_head + record_len > header.read_head {
                return Ok(false);
            }
            header.write_head
        } else if header.write_head < header.capacity_bytes {
            header.write_head
        } else if QDISK_RESERVED_SPACE + record_len <= header.read_head {
            header.end_of_ring = header.write_head;
            QDISK_RESERVED_SPACE
        } else {
            return Ok(false);
        };

        self.write_record(offset, payload)?;
        self.header.write_head = offset + record_len;
        self.header.length += 1;
        self.header.used_bytes += record_len;
        self.file_len = self.file_len.max(self.header.write_head);
        self.write_header()?;
        Ok(true)
    }

    /// Removes and returns the oldest record.
    pub fn read_oldest(&mut self) -> Result<Option<Bytes>, QueueFileError> {
        if self.header.length == 0 {
            return Ok(None);
        }
        if self.header.is_wrapped() && self.header.read_head >= self.header.end_of_ring {
            self.header.read_head = QDISK_RESERVED_SPACE;
            self.header.end_of_ring = 0;
        }

        let (payload, record_len) = read_record(
            &mut self.file,
            &self.path,
            self.header.read_head,
            self.file_len,
        )?;
        self.header.read_head += record_len;
        self.header.length -= 1;
        self.header.used_bytes = self.header.used_bytes.saturating_sub(record_len);
        if self.header.length == 0 {
            self.reset_heads();
        }
        self.write_header()?;
        Ok(Some(payload))
    }

    /// Drops every record. Used after an unreadable record.
    pub fn reset(&mut self) -> Result<(), QueueFileError> {
        self.header.length = 0;
        self.reset_heads();
        self.write_header()
    }

    /// Flushes the header and syncs the file.
    pub fn persist(&mut self) -> Result<(), QueueFileError> {
        self.write_header_bytes()?;
        self.file
            .sync_data()
            .map_err(|e| QueueFileError::io(&self.path, e))
    }

    /// Appends the in-memory tiers after the ring and persists their positions.
    ///
    /// On failure the header keeps no saved tiers, so a half-written save is
    /// never loaded.
    pub fn save_tiers<'a>(
        &mut self,
        front_cache: impl IntoIterator<Item = &'a [u8]>,
        window: impl IntoIterator<Item = &'a [u8]>,
    ) -> Result<(), QueueFileError> {
        let written = self.write_tiers(front_cache, window);
        if written.is_err() {
            self.header.front_cache_pos = 0;
            self.header.front_cache_count = 0;
            self.header.window_pos = 0;
            self.header.window_count = 0;
        }
        written
    }

    fn write_tiers<'a>(
        &mut self,
        front_cache: impl IntoIterator<Item = &'a [u8]>,
        window: impl IntoIterator<Item = &'a [u8]>,
    ) -> Result<(), QueueFileError> {
        let mut offset = self.file_len;

        self.header.front_cache_pos = offset;
        self.header.front_cache_count = 0;
        for payload in front_cache {
            self.write_record(offset, payload)?;
            offset += RECORD_HEADER_SIZE + payload.len() as u64;
            self.header.front_cache_count += 1;
        }

        self.header.window_pos = offset;
        self.header.window_count = 0;
        for payload in window {
            self.write_record(offset, payload)?;
            offset += RECORD_HEADER_SIZE + payload.len() as u64;
            self.header.window_count += 1;
        }

        self.persist()?;
        self.file_len = offset;
        Ok(())
    }

    fn take_saved_tiers(&mut self) -> Result<SavedTiers, QueueFileError> {
        if self.header.front_cache_count == 0 && self.header.window_count == 0 {
            return Ok(SavedTiers::default());
        }
        let front_cache = read_records(
            &mut self.file,
            &self.path,
            self.header.front_cache_pos,
            self.header.front_cache_count,
            self.file_len,
        )?;
        let window = read_records(
            &mut self.file,
            &self.path,
            self.header.window_pos,
            self.header.window_count,
            self.file_len,
        )?;

        let saved_start = self.header.front_cache_pos.min(self.header.window_pos);
        if saved_start >= QDISK_RESERVED_SPACE && saved_start < self.file_len {
            self.file
                .set_len(saved_start)
                .map_err(|e| QueueFileError::io(&self.path, e))?;
            self.file_len = saved_start;
        }
        self.header.front_cache_pos = 0;
        self.header.front_cache_count = 0;
        self.header.window_pos = 0;
        self.header.window_count = 0;
        self.persist()?;

        Ok(SavedTiers {
            front_cache,
            window,
        })
    }

    fn reset_heads(&mut self) {
        self.header.read_head = QDISK_RESERVED_SPACE;
        self.header.write_head = QDISK_RESERVED_SPACE;
        self.header.end_of_ring = 0;
        self.header.used_bytes = 0;
    }

    fn write_record(&mut self, offset: u64, payload: &[u8]) -> Result<(), QueueFileError> {
        let len = u32::try_from(payload.len()).map_err(|_| QueueFileError::CorruptRecord {
            path: self.path.clone(),
            offset,
        })?;
        let mut record = Vec::with_capacity(RECORD_HEADER_SIZE as usize + payload.len());
        record.extend_from_slice(&len.to_le_bytes());
        record.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
        record.extend_from_slice(payload);

        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(&record))
            .map_err(|e| QueueFileError::io(&self.path, e))
    }

    fn write_header(&mut self) -> Result<(), QueueFileError> {
        if self.header.reliable {
            self.persist()
        } else {
            self.write_header_bytes()
        }
    }

    fn write_header_bytes(&mut self) -> Result<(), QueueFileError> {
        let encoded = self.header.encode();
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.write_all(&encoded))
            .map_err(|e| QueueFileError::io(&self.path, e))
    }
}

/// Reads the header of a queue file without modifying it.
pub fn inspect(path: &Path) -> Result<QueueFileInfo, QueueFileError> {
    let mut file = File::open(path).map_err(|e| QueueFileError::io(path, e))?;
    let file_len = file
        .metadata()
        .map_err(|e| QueueFileError::io(path, e))?
        .len();
    let header = read_header(&mut file, path, file_len)?;
    Ok(QueueFileInfo {
        path: path.to_path_buf(),
        header,
        file_len,
        number_of_messages: header.length + header.front_cache_count + header.window_count,
    })
}

/// Reads every message of a queue file without modifying it.
pub fn read_contents(path: &Path) -> Result<QueueFileContents, QueueFileError> {
    let mut file = File::open(path).map_err(|e| QueueFileError::io(path, e))?;
    let file_len = file
        .metadata()
        .map_err(|e| QueueFileError::io(path, e))?
        .len();
    let header = read_header(&mut file, path, file_len)?;
    validate_header(&header, path, file_len)?;

    let front_cache = read_records(
        &mut file,
        path,
        header.front_cache_pos,
        header.front_cache_count,
        file_len,
    )?;
    let window = read_records(
        &mut file,
        path,
        header.window_pos,
        header.window_count,
        file_len,
    )?;

    let mut ring = Vec::with_capacity(usize::try_from(header.length).unwrap_or(0).min(1 << 16));
    let mut offset = header.read_head;
    let mut end_of_ring = header.end_of_ring;
    for _ in 0..header.length {
        if end_of_ring != 0 && offset >= end_of_ring {
            offset = QDISK_RESERVED_SPACE;
            end_of_ring = 0;
        }
        let (payload, record_len) = read_record(&mut file, path, offset, file_len)?;
        ring.push(payload);
        offset += record_len;
    }

    Ok(QueueFileContents {
        front_cache,
        ring,
        window,
    })
}

fn floor_kib(bytes: u64) -> u64 {
    bytes / 1024 * 1024
}

fn read_header(file: &mut File, path: &Path, file_len: u64) -> Result<QueueFileHeader, QueueFileError> {
    if file_len < HEADER_LEN as u64 {
        return Err(QueueFileError::Truncated(path.to_path_buf()));
    }
    let mut buf = [0u8; HEADER_LEN];
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.read_exact(&mut buf))
        .map_err(|e| QueueFileError::io(path, e))?;
    QueueFileHeader::decode(&buf, path)
}

fn validate_header(header: &QueueFileHeader, path: &Path, file_len: u64) -> Result<(), QueueFileError> {
    let in_file = |offset: u64| (QDISK_RESERVED_SPACE..=file_len).contains(&offset);
    if !in_file(header.read_head) || !in_file(header.write_head) {
        warn!(
            path = %path.display(),
            read_head = header.read_head,
            write_head = header.write_head,
            file_len,
            "Queue file heads point outside of the file"
        );
        return Err(QueueFileError::Truncated(path.to_path_buf()));
    }
    Ok(())
}

fn read_record(
    file: &mut File,
    path: &Path,
    offset: u64,
    file_len: u64,
) -> Result<(Bytes, u64), QueueFileError> {
    let corrupt = || QueueFileError::CorruptRecord {
        path: path.to_path_buf(),
        offset,
    };
    if offset + RECORD_HEADER_SIZE > file_len {
        return Err(corrupt());
    }
    let mut prefix = [0u8; RECORD_HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(offset))
        .and_then(|_| file.read_exact(&mut prefix))
        .map_err(|e| QueueFileError::io(path, e))?;
    let len = u64::from(u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]));
    let crc = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]);
    if len > MAX_RECORD_SIZE || offset + RECORD_HEADER_SIZE + len > file_len {
        return Err(corrupt());
    }

    let mut payload = vec![0u8; len as usize];
    file.read_exact(&mut payload)
        .map_err(|e| QueueFileError::io(path, e))?;
    if crc32fast::hash(&payload) != crc {
        return Err(corrupt());
    }
    Ok((Bytes::from(payload), RECORD_HEADER_SIZE + len))
}

fn read_records(
    file: &mut File,
    path: &Path,
    mut offset: u64,
    count: u64,
    file_len: u64,
) -> Result<Vec<Bytes>, QueueFileError> {
    let mut records = Vec::new();
    for _ in 0..count {
        let (payload, record_len) = read_record(file, path, offset, file_len)?;
        records.push(payload);
        offset += record_len;
    }
    Ok(records)
}
