//! Append-only chunk files
//!
//! A chunk is one file of record frames. While writable it carries an
//! in-memory buffer mirroring the data region and appends go through a single
//! positioned write + fsync; once sealed it is served from a read-only memory
//! map. The transition is monotonic and happens at most once.
//!
//! Layout:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ HEADER (64 bytes)                       │
//! │   magic: [u8; 16] = "feedstore.chunk\0" │
//! │   version: u32 = 1                      │
//! │   reserved: zero                        │
//! ├─────────────────────────────────────────┤
//! │ FRAMES (repeated until EOF)             │
//! │   payload_len: u32                      │
//! │   crc: u32                              │
//! │   payload: [u8; payload_len]            │
//! └─────────────────────────────────────────┘
//! ```
//!
//! A torn frame at the tail is crash evidence: the open scan stops at the
//! last good boundary and (in read-write mode) truncates the file back to it.

use crate::storage::codec::{decode_record, encode_record, validate_frame};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::FeedRecord;
use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Magic bytes for chunk file identification
const CHUNK_MAGIC: [u8; 16] = *b"feedstore.chunk\0";

/// Current chunk format version
const CHUNK_VERSION: u32 = 1;

/// Header size in bytes; frame data starts here
pub const CHUNK_HEADER_SIZE: usize = 64;

/// A bounds-checked view over a memory-mapped chunk file
///
/// All offset arithmetic is validated against the mapped length before any
/// slice is handed out; the `unsafe` mmap call is confined to `map`.
struct MappedRegion {
    map: Mmap,
    /// End of the valid data (last good frame boundary), absolute file offset
    limit: usize,
}

impl MappedRegion {
    fn map(file: &File, limit: usize) -> StorageResult<Self> {
        let map = unsafe { Mmap::map(file)? };
        if limit > map.len() {
            return Err(StorageError::Corruption(format!(
                "mapped region limit {} beyond file length {}",
                limit,
                map.len()
            )));
        }
        Ok(Self { map, limit })
    }

    fn limit(&self) -> usize {
        self.limit
    }

    /// Valid bytes from `offset` to the data limit
    fn slice_from(&self, offset: usize) -> StorageResult<&[u8]> {
        if offset > self.limit {
            return Err(StorageError::Validation(format!(
                "offset {} beyond mapped limit {}",
                offset, self.limit
            )));
        }
        Ok(&self.map[offset..self.limit])
    }
}

/// Chunk residency mode; transitions Writable -> Sealed at most once
enum ChunkState {
    /// Open file plus a buffer mirroring the data region
    Writable { file: File, buffer: Vec<u8> },
    /// Read-only memory map
    Sealed { region: MappedRegion },
}

struct ChunkInner {
    state: ChunkState,
    /// Number of validated records (tracked incrementally)
    count: u64,
}

/// One append-only chunk file within a block's chain
pub struct ChunkFile {
    id: u32,
    path: PathBuf,
    inner: RwLock<ChunkInner>,
}

impl std::fmt::Debug for ChunkFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkFile")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ChunkFile {
    /// Open or create a chunk file
    ///
    /// On create, writes the fixed header. On open-existing, validates the
    /// header and scans frame-by-frame; everything past the first bad frame
    /// is dropped (crash-recovery point). With `readonly_at_first` the file
    /// is served straight from a memory map and no write buffer is allocated,
    /// which is what cold blocks use.
    pub fn open(
        path: impl AsRef<Path>,
        id: u32,
        create_if_missing: bool,
        readonly_at_first: bool,
    ) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            if !create_if_missing || readonly_at_first {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("chunk file missing: {}", path.display()),
                )));
            }
            return Self::create(path, id);
        }

        if readonly_at_first {
            Self::open_sealed(path, id)
        } else {
            Self::open_writable(path, id)
        }
    }

    fn create(path: PathBuf, id: u32) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let mut header = [0u8; CHUNK_HEADER_SIZE];
        header[0..16].copy_from_slice(&CHUNK_MAGIC);
        header[16..20].copy_from_slice(&CHUNK_VERSION.to_le_bytes());
        file.write_all(&header)?;
        file.sync_all()?;

        Ok(Self {
            id,
            path,
            inner: RwLock::new(ChunkInner {
                state: ChunkState::Writable {
                    file,
                    buffer: Vec::new(),
                },
                count: 0,
            }),
        })
    }

    fn open_writable(path: PathBuf, id: u32) -> StorageResult<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        Self::read_header(&mut file, &path)?;

        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;

        let (valid, count) = Self::scan_valid(&buffer, &path);
        if valid < buffer.len() {
            // Torn tail from an interrupted write; cut the file back
            buffer.truncate(valid);
            file.set_len((CHUNK_HEADER_SIZE + valid) as u64)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::End(0))?;

        Ok(Self {
            id,
            path,
            inner: RwLock::new(ChunkInner {
                state: ChunkState::Writable { file, buffer },
                count,
            }),
        })
    }

    fn open_sealed(path: PathBuf, id: u32) -> StorageResult<Self> {
        let mut file = File::open(&path)?;
        Self::read_header(&mut file, &path)?;

        let file_len = file.metadata()?.len() as usize;
        let region = MappedRegion::map(&file, file_len)?;
        let (valid, count) = Self::scan_valid(&region.map[CHUNK_HEADER_SIZE..file_len], &path);
        let region = MappedRegion {
            map: region.map,
            limit: CHUNK_HEADER_SIZE + valid,
        };

        Ok(Self {
            id,
            path,
            inner: RwLock::new(ChunkInner {
                state: ChunkState::Sealed { region },
                count,
            }),
        })
    }

    fn read_header(file: &mut File, path: &Path) -> StorageResult<()> {
        let mut header = [0u8; CHUNK_HEADER_SIZE];
        file.read_exact(&mut header).map_err(|_| {
            StorageError::Corruption(format!("chunk header too short: {}", path.display()))
        })?;

        if header[0..16] != CHUNK_MAGIC {
            return Err(StorageError::Corruption(format!(
                "bad chunk magic: {}",
                path.display()
            )));
        }
        let version = u32::from_le_bytes([header[16], header[17], header[18], header[19]]);
        if version != CHUNK_VERSION {
            return Err(StorageError::Corruption(format!(
                "unsupported chunk version {}: {}",
                version,
                path.display()
            )));
        }
        Ok(())
    }

    /// Scan the data region and return (valid byte length, record count)
    ///
    /// Stops at the first truncated or checksum-failing frame; that frame and
    /// everything after it is dropped from the logical view.
    fn scan_valid(data: &[u8], path: &Path) -> (usize, u64) {
        let mut reader = Cursor::new(data);
        let mut valid = 0usize;
        let mut count = 0u64;
        loop {
            match validate_frame(&mut reader) {
                Ok(Some(n)) => {
                    valid += n as usize;
                    count += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        records = count,
                        "dropping torn chunk tail: {}",
                        e
                    );
                    break;
                }
            }
        }
        (valid, count)
    }

    /// Chunk id within its chain
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append records with a single durable write
    ///
    /// `on_durable` is invoked per record with its absolute byte offset only
    /// after the write and fsync succeed, so index updates never run ahead of
    /// durability. On any failure the buffer and file length roll back to the
    /// pre-append state so a retry cannot duplicate partial data.
    pub fn append(
        &self,
        records: &[FeedRecord],
        mut on_durable: impl FnMut(&FeedRecord, u64),
    ) -> StorageResult<()> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| StorageError::Lock(format!("chunk {}: {}", self.id, e)))?;
        let ChunkInner { state, count } = &mut *inner;

        let (file, buffer) = match state {
            ChunkState::Writable { file, buffer } => (file, buffer),
            ChunkState::Sealed { .. } => {
                return Err(StorageError::NotWritable(format!(
                    "chunk {} is read-only",
                    self.id
                )))
            }
        };

        let base = buffer.len();
        let mut offsets = Vec::with_capacity(records.len());
        for record in records {
            offsets.push((CHUNK_HEADER_SIZE + buffer.len()) as u64);
            if let Err(e) = encode_record(record, buffer) {
                buffer.truncate(base);
                return Err(e);
            }
        }

        let write_at = (CHUNK_HEADER_SIZE + base) as u64;
        let write_result = (|| -> StorageResult<()> {
            file.seek(SeekFrom::Start(write_at))?;
            file.write_all(&buffer[base..])?;
            file.sync_data()?;
            Ok(())
        })();

        if let Err(e) = write_result {
            buffer.truncate(base);
            let _ = file.set_len(write_at);
            return Err(e);
        }

        *count += records.len() as u64;
        for (record, offset) in records.iter().zip(offsets) {
            on_durable(record, offset);
        }
        Ok(())
    }

    /// Read one record at an absolute byte offset
    ///
    /// Unlike the load-time scan, a checksum mismatch here is a hard error:
    /// an interior frame the index points at must be intact.
    pub fn read(&self, offset: u64) -> StorageResult<FeedRecord> {
        let inner = self
            .inner
            .read()
            .map_err(|e| StorageError::Lock(format!("chunk {}: {}", self.id, e)))?;

        let (data, end) = match &inner.state {
            ChunkState::Writable { buffer, .. } => {
                (buffer.as_slice(), (CHUNK_HEADER_SIZE + buffer.len()) as u64)
            }
            ChunkState::Sealed { region } => {
                (region.slice_from(CHUNK_HEADER_SIZE)?, region.limit() as u64)
            }
        };

        if offset < CHUNK_HEADER_SIZE as u64 || offset >= end {
            return Err(StorageError::Validation(format!(
                "offset {} out of range [{}, {}) in chunk {}",
                offset, CHUNK_HEADER_SIZE, end, self.id
            )));
        }

        let rel = offset as usize - CHUNK_HEADER_SIZE;
        decode_record(&mut Cursor::new(&data[rel..]))
    }

    /// Sequentially visit every record with its absolute byte offset
    ///
    /// A visit error aborts the scan and propagates.
    pub fn range(
        &self,
        mut visit: impl FnMut(FeedRecord, u64) -> StorageResult<()>,
    ) -> StorageResult<()> {
        let inner = self
            .inner
            .read()
            .map_err(|e| StorageError::Lock(format!("chunk {}: {}", self.id, e)))?;

        let data = match &inner.state {
            ChunkState::Writable { buffer, .. } => buffer.as_slice(),
            ChunkState::Sealed { region } => region.slice_from(CHUNK_HEADER_SIZE)?,
        };

        let mut pos = 0usize;
        while pos < data.len() {
            let mut reader = Cursor::new(&data[pos..]);
            let record = decode_record(&mut reader)?;
            visit(record, (CHUNK_HEADER_SIZE + pos) as u64)?;
            pos += reader.position() as usize;
        }
        Ok(())
    }

    /// Seal the chunk read-only; idempotent
    ///
    /// Drops the write buffer and serves further reads from a memory map.
    pub fn ensure_readonly(&self) -> StorageResult<()> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| StorageError::Lock(format!("chunk {}: {}", self.id, e)))?;

        if let ChunkState::Writable { file, buffer } = &mut inner.state {
            file.sync_all()?;
            let limit = CHUNK_HEADER_SIZE + buffer.len();
            let readonly = File::open(&self.path)?;
            let region = MappedRegion::map(&readonly, limit)?;
            inner.state = ChunkState::Sealed { region };
            tracing::debug!(chunk = self.id, bytes = limit, "sealed chunk read-only");
        }
        Ok(())
    }

    /// Number of validated records in this chunk
    pub fn count(&self) -> u64 {
        self.inner.read().map(|inner| inner.count).unwrap_or(0)
    }

    /// Current end offset (header + valid data), used for rotation checks
    pub fn size(&self) -> u64 {
        self.inner
            .read()
            .map(|inner| match &inner.state {
                ChunkState::Writable { buffer, .. } => (CHUNK_HEADER_SIZE + buffer.len()) as u64,
                ChunkState::Sealed { region } => region.limit() as u64,
            })
            .unwrap_or(CHUNK_HEADER_SIZE as u64)
    }

    /// Whether this chunk still accepts appends
    pub fn is_writable(&self) -> bool {
        self.inner
            .read()
            .map(|inner| matches!(inner.state, ChunkState::Writable { .. }))
            .unwrap_or(false)
    }
}
