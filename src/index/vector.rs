//! Vector index - semantic similarity filtering
//!
//! Exact brute-force cosine scoring. A block holds one bounded time window
//! of feeds, so a linear scan over a few thousand vectors beats maintaining
//! an approximate structure; the `search` contract is the stable surface and
//! the internals are free to change.

use crate::index::{read_index_header, write_index_header};
use crate::storage::error::{StorageError, StorageResult};
use std::collections::HashMap;
use std::io::{Read, Write};

const VECTOR_MAGIC: [u8; 16] = *b"feedstore.vector";
const VECTOR_VERSION: u8 = 1;

/// Cosine similarity between two vectors, accumulated in f64
///
/// This is the one scoring function used everywhere similarities are
/// compared, so scores stay comparable across call sites. Returns 0.0 for
/// mismatched dimensions or zero-norm inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let x = f64::from(x);
        let y = f64::from(y);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= f64::EPSILON {
        return 0.0;
    }
    (dot / denom) as f32
}

/// Similarity index over record embedding vectors
#[derive(Debug, Default)]
pub struct VectorIndex {
    /// id → that record's vectors (several per record from long-text splits)
    entries: HashMap<u64, Vec<Vec<f32>>>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index one or more vectors under an id; repeated adds accumulate
    pub fn add(&mut self, id: u64, vectors: &[Vec<f32>]) {
        if vectors.is_empty() {
            return;
        }
        self.entries
            .entry(id)
            .or_default()
            .extend(vectors.iter().cloned());
    }

    /// Ids whose best vector scores at least `threshold` against the query,
    /// at most `limit` of them, scored by that best match
    pub fn search(&self, query: &[f32], threshold: f32, limit: usize) -> HashMap<u64, f32> {
        let mut scored: Vec<(u64, f32)> = self
            .entries
            .iter()
            .filter_map(|(&id, vectors)| {
                let best = vectors
                    .iter()
                    .map(|v| cosine_similarity(query, v))
                    .fold(f32::NEG_INFINITY, f32::max);
                (best >= threshold).then_some((id, best))
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        scored.into_iter().collect()
    }

    /// Number of indexed ids
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Serialize for archival
    pub fn encode_to<W: Write>(&self, writer: &mut W) -> StorageResult<()> {
        write_index_header(writer, &VECTOR_MAGIC, VECTOR_VERSION)?;
        writer.write_all(&(self.entries.len() as u32).to_le_bytes())?;
        for (id, vectors) in &self.entries {
            writer.write_all(&id.to_le_bytes())?;
            writer.write_all(&(vectors.len() as u32).to_le_bytes())?;
            let dimension = vectors.first().map(|v| v.len()).unwrap_or(0);
            writer.write_all(&(dimension as u32).to_le_bytes())?;
            for vector in vectors {
                for value in vector {
                    writer.write_all(&value.to_le_bytes())?;
                }
            }
        }
        Ok(())
    }

    /// Rebuild from an archived stream
    pub fn decode_from<R: Read>(reader: &mut R) -> StorageResult<Self> {
        read_index_header(reader, &VECTOR_MAGIC, VECTOR_VERSION, "vector index")?;

        let entry_count = read_u32(reader)? as usize;
        let mut entries = HashMap::with_capacity(entry_count);

        for _ in 0..entry_count {
            let mut id_buf = [0u8; 8];
            reader.read_exact(&mut id_buf).map_err(|_| {
                StorageError::Corruption("vector index entry cut short".to_string())
            })?;
            let id = u64::from_le_bytes(id_buf);

            let vector_count = read_u32(reader)? as usize;
            let dimension = read_u32(reader)? as usize;

            let mut vectors = Vec::with_capacity(vector_count);
            let mut value_buf = [0u8; 4];
            for _ in 0..vector_count {
                let mut vector = Vec::with_capacity(dimension);
                for _ in 0..dimension {
                    reader.read_exact(&mut value_buf).map_err(|_| {
                        StorageError::Corruption("vector index values cut short".to_string())
                    })?;
                    vector.push(f32::from_le_bytes(value_buf));
                }
                vectors.push(vector);
            }
            entries.insert(id, vectors);
        }

        Ok(Self { entries })
    }
}

fn read_u32<R: Read>(reader: &mut R) -> StorageResult<u32> {
    let mut buf = [0u8; 4];
    reader
        .read_exact(&mut buf)
        .map_err(|_| StorageError::Corruption("vector index stream cut short".to_string()))?;
    Ok(u32::from_le_bytes(buf))
}
