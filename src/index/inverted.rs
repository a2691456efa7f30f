//! Inverted index - label-based filtering
//!
//! Maps label key → value → set of feed ids, plus a global set of every
//! indexed id so that not-equals and absent-label filters can be answered as
//! complements.

use crate::index::{read_index_header, write_index_header};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::Label;
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};

const INVERTED_MAGIC: [u8; 16] = *b"feedstore.label\0";
const INVERTED_VERSION: u8 = 1;

/// Values longer than this are not indexed; nobody exact-matches against a
/// whole article body and the entries would only bloat the value map.
pub const MAX_INDEXED_VALUE_LEN: usize = 64;

/// One label predicate: `label == value` or `label != value`
///
/// An empty value flips the meaning to presence: `equal` with an empty value
/// selects ids that do not carry the label at all; not-equal with an empty
/// value selects ids that carry it with any value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelFilter {
    pub label: String,
    pub value: String,
    pub equal: bool,
}

impl LabelFilter {
    pub fn equals(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
            equal: true,
        }
    }

    pub fn not_equals(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
            equal: false,
        }
    }
}

/// Inverted index over feed labels
#[derive(Debug, Default)]
pub struct InvertedIndex {
    /// label key → value → ids
    labels: HashMap<String, HashMap<String, HashSet<u64>>>,
    /// Every id ever added
    all_ids: HashSet<u64>,
}

impl InvertedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index one record's labels
    ///
    /// Pairs with an empty key or value, or a value over the index cap, are
    /// skipped; the id still joins the global set.
    pub fn add(&mut self, id: u64, labels: &[Label]) {
        self.all_ids.insert(id);
        for label in labels {
            if label.key.is_empty()
                || label.value.is_empty()
                || label.value.len() > MAX_INDEXED_VALUE_LEN
            {
                continue;
            }
            self.labels
                .entry(label.key.clone())
                .or_default()
                .entry(label.value.clone())
                .or_default()
                .insert(id);
        }
    }

    /// Evaluate one label predicate to a set of ids
    pub fn search(&self, filter: &LabelFilter) -> HashSet<u64> {
        let values = self.labels.get(&filter.label);

        if filter.value.is_empty() {
            // Presence semantics
            let with_label: HashSet<u64> = values
                .map(|v| v.values().flatten().copied().collect())
                .unwrap_or_default();
            if filter.equal {
                // label absent
                self.all_ids.difference(&with_label).copied().collect()
            } else {
                // label present with any value
                with_label
            }
        } else {
            let matched: HashSet<u64> = values
                .and_then(|v| v.get(&filter.value))
                .cloned()
                .unwrap_or_default();
            if filter.equal {
                matched
            } else {
                self.all_ids.difference(&matched).copied().collect()
            }
        }
    }

    /// Number of ids in the global set
    pub fn id_count(&self) -> usize {
        self.all_ids.len()
    }

    /// Number of distinct label keys
    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    /// Serialize for archival
    ///
    /// Format: magic + version, total id count, label count, then per label:
    /// length-prefixed key, value count, per value: length-prefixed value,
    /// id count, raw u64 ids.
    pub fn encode_to<W: Write>(&self, writer: &mut W) -> StorageResult<()> {
        write_index_header(writer, &INVERTED_MAGIC, INVERTED_VERSION)?;
        writer.write_all(&(self.all_ids.len() as u32).to_le_bytes())?;
        writer.write_all(&(self.labels.len() as u32).to_le_bytes())?;

        for (key, values) in &self.labels {
            write_string(writer, key)?;
            writer.write_all(&(values.len() as u32).to_le_bytes())?;
            for (value, ids) in values {
                write_string(writer, value)?;
                writer.write_all(&(ids.len() as u32).to_le_bytes())?;
                for id in ids {
                    writer.write_all(&id.to_le_bytes())?;
                }
            }
        }
        Ok(())
    }

    /// Rebuild the nested map and the global id set in one pass
    pub fn decode_from<R: Read>(reader: &mut R) -> StorageResult<Self> {
        read_index_header(reader, &INVERTED_MAGIC, INVERTED_VERSION, "inverted index")?;

        let total_ids = read_u32(reader)? as usize;
        let label_count = read_u32(reader)? as usize;

        let mut labels = HashMap::with_capacity(label_count);
        let mut all_ids = HashSet::with_capacity(total_ids);

        for _ in 0..label_count {
            let key = read_string(reader)?;
            let value_count = read_u32(reader)? as usize;

            let mut values = HashMap::with_capacity(value_count);
            for _ in 0..value_count {
                let value = read_string(reader)?;
                let id_count = read_u32(reader)? as usize;

                let mut ids = HashSet::with_capacity(id_count);
                let mut id_buf = [0u8; 8];
                for _ in 0..id_count {
                    reader.read_exact(&mut id_buf).map_err(|_| {
                        StorageError::Corruption("inverted index id list cut short".to_string())
                    })?;
                    let id = u64::from_le_bytes(id_buf);
                    ids.insert(id);
                    all_ids.insert(id);
                }
                values.insert(value, ids);
            }
            labels.insert(key, values);
        }

        Ok(Self { labels, all_ids })
    }
}

fn write_string<W: Write>(writer: &mut W, s: &str) -> StorageResult<()> {
    writer.write_all(&(s.len() as u32).to_le_bytes())?;
    writer.write_all(s.as_bytes())?;
    Ok(())
}

fn read_u32<R: Read>(reader: &mut R) -> StorageResult<u32> {
    let mut buf = [0u8; 4];
    reader
        .read_exact(&mut buf)
        .map_err(|_| StorageError::Corruption("inverted index stream cut short".to_string()))?;
    Ok(u32::from_le_bytes(buf))
}

fn read_string<R: Read>(reader: &mut R) -> StorageResult<String> {
    let len = read_u32(reader)? as usize;
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .map_err(|_| StorageError::Corruption("inverted index string cut short".to_string()))?;
    String::from_utf8(buf)
        .map_err(|e| StorageError::Corruption(format!("invalid UTF-8 in index: {}", e)))
}
