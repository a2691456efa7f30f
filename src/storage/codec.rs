//! Record frame codec
//!
//! Encodes one feed record to a self-checksummed binary frame and back.
//!
//! Frame layout (all integers little-endian):
//! - payload_len: u32
//! - crc: u32 (CRC32 of payload)
//! - payload:
//!   - id: u64
//!   - time: i64 (Unix nanoseconds)
//!   - label_count: u32, then per label: key_len u32 + key, value_len u32 + value
//!   - vector_count: u32, then if > 0: dimension u32, then raw f32 values per vector
//!
//! Decoding is defensive: a short read before the declared length is a
//! `Truncated` error, never a panic. `validate_frame` checks integrity without
//! materializing the record, which is what the chunk-load scan uses to find
//! the last good frame boundary after a crash.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{FeedRecord, Label};
use std::io::Read;

/// Size of the frame header (payload length + CRC32)
pub const FRAME_HEADER_SIZE: usize = 8;

/// Sanity cap on a single frame's payload; anything larger is corruption
const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Encode a record as one frame, appending to `buf`
///
/// The buffer's existing contents are preserved, so a caller can encode a
/// whole batch into one allocation. On error nothing is appended.
pub fn encode_record(record: &FeedRecord, buf: &mut Vec<u8>) -> StorageResult<()> {
    // All vectors in one record must share one dimension
    if let Some(dim) = record.vector_dimension() {
        for vector in &record.vectors {
            if vector.len() != dim {
                return Err(StorageError::Validation(format!(
                    "mixed vector dimensions in record {}: {} vs {}",
                    record.id,
                    dim,
                    vector.len()
                )));
            }
        }
        if dim == 0 {
            return Err(StorageError::Validation(format!(
                "empty vector in record {}",
                record.id
            )));
        }
    }

    let base = buf.len();
    // Reserve the frame header; filled in after the payload is known
    buf.extend_from_slice(&[0u8; FRAME_HEADER_SIZE]);

    buf.extend_from_slice(&record.id.to_le_bytes());
    buf.extend_from_slice(&record.time.to_le_bytes());

    buf.extend_from_slice(&(record.labels.len() as u32).to_le_bytes());
    for label in &record.labels {
        buf.extend_from_slice(&(label.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(label.key.as_bytes());
        buf.extend_from_slice(&(label.value.len() as u32).to_le_bytes());
        buf.extend_from_slice(label.value.as_bytes());
    }

    buf.extend_from_slice(&(record.vectors.len() as u32).to_le_bytes());
    if let Some(dim) = record.vector_dimension() {
        buf.extend_from_slice(&(dim as u32).to_le_bytes());
        for vector in &record.vectors {
            for value in vector {
                buf.extend_from_slice(&value.to_le_bytes());
            }
        }
    }

    let payload_len = buf.len() - base - FRAME_HEADER_SIZE;
    let crc = crc32fast::hash(&buf[base + FRAME_HEADER_SIZE..]);
    buf[base..base + 4].copy_from_slice(&(payload_len as u32).to_le_bytes());
    buf[base + 4..base + 8].copy_from_slice(&crc.to_le_bytes());

    Ok(())
}

/// Decode one frame from a reader
///
/// Verifies the CRC32 before parsing any field.
pub fn decode_record<R: Read>(reader: &mut R) -> StorageResult<FeedRecord> {
    let payload = read_verified_payload(reader)?
        .ok_or_else(|| StorageError::Truncated("empty frame at read offset".to_string()))?;
    parse_payload(&payload)
}

/// Validate one frame's integrity without materializing the record
///
/// Returns `Ok(None)` on clean EOF at a frame boundary, `Ok(Some(n))` for a
/// valid frame of `n` total bytes, and an error for a truncated or
/// checksum-failing frame.
pub fn validate_frame<R: Read>(reader: &mut R) -> StorageResult<Option<u64>> {
    match read_verified_payload(reader)? {
        Some(payload) => Ok(Some((FRAME_HEADER_SIZE + payload.len()) as u64)),
        None => Ok(None),
    }
}

/// Read one frame header + payload, verifying the checksum
///
/// Returns `Ok(None)` on clean EOF before the first header byte.
fn read_verified_payload<R: Read>(reader: &mut R) -> StorageResult<Option<Vec<u8>>> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    let mut read = 0;
    while read < header.len() {
        match reader.read(&mut header[read..]) {
            Ok(0) if read == 0 => return Ok(None),
            Ok(0) => {
                return Err(StorageError::Truncated(format!(
                    "frame header cut short at {} of {} bytes",
                    read, FRAME_HEADER_SIZE
                )))
            }
            Ok(n) => read += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let payload_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let stored_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    if payload_len > MAX_PAYLOAD_LEN {
        return Err(StorageError::Corruption(format!(
            "frame payload length {} exceeds cap",
            payload_len
        )));
    }

    let mut payload = vec![0u8; payload_len];
    let mut hasher = crc32fast::Hasher::new();
    let mut filled = 0;
    while filled < payload_len {
        match reader.read(&mut payload[filled..]) {
            Ok(0) => {
                return Err(StorageError::Truncated(format!(
                    "frame payload cut short at {} of {} bytes",
                    filled, payload_len
                )))
            }
            Ok(n) => {
                hasher.update(&payload[filled..filled + n]);
                filled += n;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let computed = hasher.finalize();
    if computed != stored_crc {
        return Err(StorageError::ChecksumMismatch {
            stored: stored_crc,
            computed,
        });
    }

    Ok(Some(payload))
}

/// Parse a checksum-verified payload into a record
fn parse_payload(payload: &[u8]) -> StorageResult<FeedRecord> {
    let mut cursor = Cursor::new(payload);

    let id = cursor.read_u64()?;
    let time = cursor.read_i64()?;

    let label_count = cursor.read_u32()? as usize;
    let mut labels = Vec::with_capacity(label_count.min(256));
    for _ in 0..label_count {
        let key = cursor.read_string()?;
        let value = cursor.read_string()?;
        labels.push(Label { key, value });
    }

    let vector_count = cursor.read_u32()? as usize;
    let mut vectors = Vec::with_capacity(vector_count.min(64));
    if vector_count > 0 {
        let dimension = cursor.read_u32()? as usize;
        for _ in 0..vector_count {
            let mut vector = Vec::with_capacity(dimension);
            for _ in 0..dimension {
                vector.push(f32::from_le_bytes(cursor.read_array::<4>()?));
            }
            vectors.push(vector);
        }
    }

    Ok(FeedRecord {
        id,
        time,
        labels,
        vectors,
    })
}

/// Bounds-checked reader over a payload slice
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_array<const N: usize>(&mut self) -> StorageResult<[u8; N]> {
        let end = self.pos.checked_add(N).filter(|&e| e <= self.data.len());
        let end = end.ok_or_else(|| {
            StorageError::Truncated(format!(
                "payload cut short at {} of {} bytes",
                self.pos,
                self.data.len()
            ))
        })?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(out)
    }

    fn read_u32(&mut self) -> StorageResult<u32> {
        Ok(u32::from_le_bytes(self.read_array::<4>()?))
    }

    fn read_u64(&mut self) -> StorageResult<u64> {
        Ok(u64::from_le_bytes(self.read_array::<8>()?))
    }

    fn read_i64(&mut self) -> StorageResult<i64> {
        Ok(i64::from_le_bytes(self.read_array::<8>()?))
    }

    fn read_string(&mut self) -> StorageResult<String> {
        let len = self.read_u32()? as usize;
        let end = self.pos.checked_add(len).filter(|&e| e <= self.data.len());
        let end = end.ok_or_else(|| {
            StorageError::Truncated(format!("string of {} bytes overruns payload", len))
        })?;
        let s = std::str::from_utf8(&self.data[self.pos..end])
            .map_err(|e| StorageError::Corruption(format!("invalid UTF-8 in label: {}", e)))?
            .to_string();
        self.pos = end;
        Ok(s)
    }
}
