//! Block index structures
//!
//! Three independent indexes answer the three query dimensions:
//!
//! - **PrimaryIndex**: identifier → `FeedRef` location
//! - **InvertedIndex**: label key/value → id sets, with presence semantics
//! - **VectorIndex**: embedding similarity → id → score
//!
//! While a block is Hot the indexes are rebuilt from the chunk chain; the
//! binary archive formats only matter across the Cold lifecycle. All three
//! share the same framing discipline: a 16-byte magic, a version byte, then
//! a format-specific body.

mod inverted;
mod primary;
mod vector;

pub use inverted::{InvertedIndex, LabelFilter, MAX_INDEXED_VALUE_LEN};
pub use primary::PrimaryIndex;
pub use vector::{cosine_similarity, VectorIndex};

use crate::storage::error::{StorageError, StorageResult};
use std::io::{Read, Write};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// The three indexes of one block, swapped in and out as a single unit
///
/// Reload and eviction replace the whole set behind one `Arc`, never the
/// three handles independently, so readers can never observe a torn mix of
/// old and new indexes. Each index carries its own lock so writer tasks can
/// update them while only holding the block-level lock in read mode.
#[derive(Debug, Default)]
pub struct IndexSet {
    pub primary: RwLock<PrimaryIndex>,
    pub inverted: RwLock<InvertedIndex>,
    pub vector: RwLock<VectorIndex>,
}

impl IndexSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parts(primary: PrimaryIndex, inverted: InvertedIndex, vector: VectorIndex) -> Self {
        Self {
            primary: RwLock::new(primary),
            inverted: RwLock::new(inverted),
            vector: RwLock::new(vector),
        }
    }
}

/// Read-lock an index, tolerating poisoning
///
/// Index mutations are plain inserts that leave the structure consistent
/// even if a holder panicked mid-update, so the poison flag carries no
/// information here.
pub(crate) fn read_guard<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Write-lock an index, tolerating poisoning
pub(crate) fn write_guard<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Write the shared magic + version prefix of an index archive
pub(crate) fn write_index_header<W: Write>(
    writer: &mut W,
    magic: &[u8; 16],
    version: u8,
) -> StorageResult<()> {
    writer.write_all(magic)?;
    writer.write_all(&[version])?;
    Ok(())
}

/// Validate the magic + version prefix of an index archive
pub(crate) fn read_index_header<R: Read>(
    reader: &mut R,
    magic: &[u8; 16],
    version: u8,
    what: &str,
) -> StorageResult<()> {
    let mut header = [0u8; 17];
    reader
        .read_exact(&mut header)
        .map_err(|_| StorageError::Corruption(format!("{} header too short", what)))?;
    if header[0..16] != magic[..] {
        return Err(StorageError::Corruption(format!("bad {} magic", what)));
    }
    if header[16] != version {
        return Err(StorageError::Corruption(format!(
            "unsupported {} version {}",
            what, header[16]
        )));
    }
    Ok(())
}
