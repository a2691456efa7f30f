//! Primary index - authoritative identifier → location map
//!
//! While a block is Hot this index is rebuilt by replaying chunks, so the
//! binary archive format is only read and written around the Cold lifecycle.

use crate::index::{read_index_header, write_index_header};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::FeedRef;
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};

const PRIMARY_MAGIC: [u8; 16] = *b"feedstore.prim\0\0";
const PRIMARY_VERSION: u8 = 1;

/// Identifier → `FeedRef` map with full-id enumeration
#[derive(Debug, Default)]
pub struct PrimaryIndex {
    entries: HashMap<u64, FeedRef>,
}

impl PrimaryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a mapping (last write wins)
    pub fn add(&mut self, id: u64, feed_ref: FeedRef) {
        self.entries.insert(id, feed_ref);
    }

    /// Look up the location of an identifier
    pub fn search(&self, id: u64) -> Option<FeedRef> {
        self.entries.get(&id).copied()
    }

    /// All known identifiers, used to resolve an unrestricted filter pass
    pub fn ids(&self) -> HashSet<u64> {
        self.entries.keys().copied().collect()
    }

    /// Number of entries
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Serialize the full map for archival
    pub fn encode_to<W: Write>(&self, writer: &mut W) -> StorageResult<()> {
        write_index_header(writer, &PRIMARY_MAGIC, PRIMARY_VERSION)?;
        writer.write_all(&(self.entries.len() as u32).to_le_bytes())?;
        for (id, feed_ref) in &self.entries {
            writer.write_all(&id.to_le_bytes())?;
            writer.write_all(&feed_ref.chunk.to_le_bytes())?;
            writer.write_all(&feed_ref.offset.to_le_bytes())?;
            writer.write_all(&feed_ref.time.to_le_bytes())?;
        }
        Ok(())
    }

    /// Rebuild the map from an archived stream
    pub fn decode_from<R: Read>(reader: &mut R) -> StorageResult<Self> {
        read_index_header(reader, &PRIMARY_MAGIC, PRIMARY_VERSION, "primary index")?;

        let mut count_buf = [0u8; 4];
        reader.read_exact(&mut count_buf)?;
        let count = u32::from_le_bytes(count_buf) as usize;

        let mut entries = HashMap::with_capacity(count);
        let mut entry = [0u8; 28];
        for _ in 0..count {
            reader.read_exact(&mut entry).map_err(|_| {
                StorageError::Corruption("primary index entry cut short".to_string())
            })?;
            let id = u64::from_le_bytes(entry[0..8].try_into().unwrap());
            let chunk = u32::from_le_bytes(entry[8..12].try_into().unwrap());
            let offset = u64::from_le_bytes(entry[12..20].try_into().unwrap());
            let time = i64::from_le_bytes(entry[20..28].try_into().unwrap());
            entries.insert(id, FeedRef::new(chunk, offset, time));
        }

        Ok(Self { entries })
    }
}
