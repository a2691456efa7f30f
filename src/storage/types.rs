//! Core data types for the feed storage engine
//!
//! This module defines the fundamental types used throughout the storage layer:
//! - `FeedRecord`: One ingested feed item with labels and embedding vectors
//! - `Label`: A single (key, value) metadata pair
//! - `FeedRef`: Location of a record's bytes within a block's chunk chain
//! - `TimeRange`: A half-open time interval for queries

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A single feed record
///
/// The id is content-derived by the upstream collector and stable across
/// re-ingestion. Labels and vectors are immutable once written.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedRecord {
    /// Content-derived identifier
    pub id: u64,
    /// Event time, Unix nanoseconds
    pub time: i64,
    /// Metadata labels, unique keys, sorted by key
    pub labels: Vec<Label>,
    /// Embedding vectors (may be empty; one per semantically-split value)
    pub vectors: Vec<Vec<f32>>,
}

/// A (key, value) metadata pair attached to a feed record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub key: String,
    pub value: String,
}

impl Label {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl FeedRecord {
    /// Create a new record with the current timestamp
    pub fn new(id: u64) -> Self {
        Self {
            id,
            time: now_nanos(),
            labels: Vec::new(),
            vectors: Vec::new(),
        }
    }

    /// Create a record with a specific event time (Unix nanoseconds)
    pub fn with_time(id: u64, time: i64) -> Self {
        Self {
            id,
            time,
            labels: Vec::new(),
            vectors: Vec::new(),
        }
    }

    /// Builder method: add a label, keeping keys unique and sorted
    ///
    /// Setting an existing key replaces its value.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.labels.binary_search_by(|l| l.key.as_str().cmp(&key)) {
            Ok(idx) => self.labels[idx].value = value,
            Err(idx) => self.labels.insert(idx, Label { key, value }),
        }
        self
    }

    /// Builder method: attach an embedding vector
    pub fn vector(mut self, vector: Vec<f32>) -> Self {
        self.vectors.push(vector);
        self
    }

    /// Get the value of a label, if present
    pub fn get_label(&self, key: &str) -> Option<&str> {
        self.labels
            .binary_search_by(|l| l.key.as_str().cmp(key))
            .ok()
            .map(|idx| self.labels[idx].value.as_str())
    }

    /// Check if this record has a specific label value
    pub fn has_label(&self, key: &str, value: &str) -> bool {
        self.get_label(key).map(|v| v == value).unwrap_or(false)
    }

    /// The shared dimension of this record's vectors, if any
    pub fn vector_dimension(&self) -> Option<usize> {
        self.vectors.first().map(|v| v.len())
    }

    /// Get estimated encoded size in bytes (for batching decisions)
    pub fn estimated_size(&self) -> usize {
        // Frame header 8 + id 8 + time 8 + counts
        let label_size: usize = self
            .labels
            .iter()
            .map(|l| l.key.len() + l.value.len() + 8)
            .sum();
        let vector_size: usize = self.vectors.iter().map(|v| v.len() * 4).sum();
        28 + label_size + vector_size
    }
}

/// Location of one record's bytes within a block's chunk chain
///
/// Produced exactly once per durable append and stored in the primary index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeedRef {
    /// Chunk file id within the chain
    pub chunk: u32,
    /// Absolute byte offset of the frame within the chunk file
    pub offset: u64,
    /// Event time of the record, Unix nanoseconds
    pub time: i64,
}

impl FeedRef {
    pub fn new(chunk: u32, offset: u64, time: i64) -> Self {
        Self {
            chunk,
            offset,
            time,
        }
    }
}

/// Current wall-clock time as Unix nanoseconds
pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Time range for queries (half-open interval: [start, end)), in nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: i64,
    /// End timestamp (exclusive)
    pub end: i64,
}

impl TimeRange {
    /// Create a time range, returning None if invalid
    pub fn try_new(start: i64, end: i64) -> Option<Self> {
        if start < end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    /// Create a new time range
    ///
    /// # Panics
    /// Panics if start >= end
    pub fn new(start: i64, end: i64) -> Self {
        assert!(start < end, "TimeRange: start must be less than end");
        Self { start, end }
    }

    /// Create a range for the last N hours from now
    pub fn last_hours(hours: i64) -> Self {
        let end = now_nanos();
        let start = end - hours * 3600 * 1_000_000_000;
        Self { start, end }
    }

    /// Check if a timestamp falls within this range
    pub fn contains(&self, time: i64) -> bool {
        time >= self.start && time < self.end
    }

    /// Check if this range overlaps with another
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && self.end > other.start
    }

    /// Get intersection with another range, if any
    pub fn intersection(&self, other: &TimeRange) -> Option<Self> {
        Self::try_new(self.start.max(other.start), self.end.min(other.end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_builder() {
        let record = FeedRecord::with_time(42, 1_000)
            .label("source", "hn")
            .label("category", "tech");

        assert_eq!(record.id, 42);
        assert_eq!(record.time, 1_000);
        assert!(record.has_label("source", "hn"));
        assert!(!record.has_label("source", "rss"));
        // Keys stay sorted
        assert_eq!(record.labels[0].key, "category");
        assert_eq!(record.labels[1].key, "source");
    }

    #[test]
    fn test_label_replacement() {
        let record = FeedRecord::new(1)
            .label("source", "hn")
            .label("source", "rss");

        assert_eq!(record.labels.len(), 1);
        assert_eq!(record.get_label("source"), Some("rss"));
    }

    #[test]
    fn test_vector_dimension() {
        let record = FeedRecord::new(1).vector(vec![0.1, 0.2, 0.3]);
        assert_eq!(record.vector_dimension(), Some(3));
        assert_eq!(FeedRecord::new(2).vector_dimension(), None);
    }

    #[test]
    fn test_time_range_contains() {
        let range = TimeRange::new(1000, 2000);

        assert!(!range.contains(999));
        assert!(range.contains(1000));
        assert!(range.contains(1999));
        assert!(!range.contains(2000));
    }

    #[test]
    fn test_time_range_overlaps() {
        let range1 = TimeRange::new(1000, 2000);
        let range2 = TimeRange::new(1500, 2500);
        let range3 = TimeRange::new(2000, 3000);

        assert!(range1.overlaps(&range2));
        assert!(!range1.overlaps(&range3)); // Adjacent, not overlapping
    }

    #[test]
    fn test_time_range_intersection() {
        let range1 = TimeRange::new(1000, 2000);
        let range2 = TimeRange::new(1500, 2500);

        let overlap = range1.intersection(&range2).unwrap();
        assert_eq!(overlap, TimeRange::new(1500, 2000));

        assert!(range1.intersection(&TimeRange::new(3000, 4000)).is_none());
    }
}
