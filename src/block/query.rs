//! Query options, filter algebra, and result ranking
//!
//! A query is resolved in three passes: label filters intersect to one
//! [`FilterResult`], the semantic filter produces another, and the merged
//! survivors are ranked through a bounded min-heap keyed by (score, time).

use crate::block::BlockConfig;
use crate::index::LabelFilter;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{FeedRecord, TimeRange};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Caller-facing query options; unset fields fall back to configured defaults
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Semantic query text; absent means no vector filtering
    pub query: Option<String>,
    /// Label predicates, AND semantics
    pub filters: Vec<LabelFilter>,
    /// Minimum similarity score for semantic matches
    pub threshold: Option<f32>,
    /// Maximum number of results
    pub limit: Option<usize>,
    /// Time window; defaults to the block's own window
    pub range: Option<TimeRange>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn semantic(mut self, text: impl Into<String>) -> Self {
        self.query = Some(text.into());
        self
    }

    pub fn filter(mut self, filter: LabelFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn threshold(mut self, threshold: f32) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn range(mut self, range: TimeRange) -> Self {
        self.range = Some(range);
        self
    }

    /// Validate and fill in defaults
    pub(crate) fn normalize(
        self,
        config: &BlockConfig,
        block_range: TimeRange,
    ) -> StorageResult<NormalizedQuery> {
        let threshold = self.threshold.unwrap_or(config.default_threshold);
        if !(-1.0..=1.0).contains(&threshold) {
            return Err(StorageError::Validation(format!(
                "threshold {} outside [-1, 1]",
                threshold
            )));
        }

        let limit = match self.limit {
            None => config.default_limit,
            Some(0) => {
                return Err(StorageError::Validation(
                    "limit must be positive".to_string(),
                ))
            }
            Some(n) => n.min(config.max_limit),
        };

        let mut seen = HashSet::new();
        for filter in &self.filters {
            if filter.label.is_empty() {
                return Err(StorageError::Validation(
                    "label filter with empty label name".to_string(),
                ));
            }
            if !seen.insert(filter.label.as_str()) {
                return Err(StorageError::Validation(format!(
                    "duplicate filter for label '{}'",
                    filter.label
                )));
            }
        }

        let query = self.query.filter(|q| !q.trim().is_empty());

        Ok(NormalizedQuery {
            query,
            filters: self.filters,
            threshold,
            limit,
            range: self.range.unwrap_or(block_range),
        })
    }
}

/// A validated query with every default resolved
#[derive(Debug, Clone)]
pub(crate) struct NormalizedQuery {
    pub query: Option<String>,
    pub filters: Vec<LabelFilter>,
    pub threshold: f32,
    pub limit: usize,
    pub range: TimeRange,
}

/// Outcome of one filter pass, with the two reserved sentinels
///
/// `Unrestricted` means the pass imposed no restriction (match-all);
/// `Matched` with an empty map is match-nothing, distinguishable from
/// absence. Intersection lets the sentinels absorb correctly.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterResult {
    Unrestricted,
    Matched(HashMap<u64, f32>),
}

impl FilterResult {
    pub fn match_nothing() -> Self {
        FilterResult::Matched(HashMap::new())
    }

    /// Lift an id set into a result; set membership scores 1.0
    pub fn from_ids(ids: HashSet<u64>) -> Self {
        FilterResult::Matched(ids.into_iter().map(|id| (id, 1.0)).collect())
    }

    pub fn is_match_nothing(&self) -> bool {
        matches!(self, FilterResult::Matched(map) if map.is_empty())
    }

    /// Intersect two passes; on overlap the larger score survives so a
    /// similarity score is never diluted by a 1.0 label match
    pub fn intersect(self, other: FilterResult) -> FilterResult {
        match (self, other) {
            (FilterResult::Unrestricted, x) => x,
            (x, FilterResult::Unrestricted) => x,
            (FilterResult::Matched(a), FilterResult::Matched(b)) => {
                let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
                FilterResult::Matched(
                    small
                        .into_iter()
                        .filter_map(|(id, s)| large.get(&id).map(|&t| (id, s.max(t))))
                        .collect(),
                )
            }
        }
    }
}

/// One ranked query hit
#[derive(Debug, Clone)]
pub struct ScoredFeed {
    pub record: FeedRecord,
    pub score: f32,
}

impl ScoredFeed {
    fn rank(&self, other: &Self) -> Ordering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.record.time.cmp(&other.record.time))
    }
}

impl PartialEq for ScoredFeed {
    fn eq(&self, other: &Self) -> bool {
        self.rank(other) == Ordering::Equal
    }
}

impl Eq for ScoredFeed {}

impl PartialOrd for ScoredFeed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoredFeed {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank(other)
    }
}

/// Bounded min-heap keeping the top `limit` hits by (score, then recency)
///
/// On overflow the lowest-scored (and among ties, oldest) entry is evicted.
pub(crate) struct TopK {
    heap: BinaryHeap<Reverse<ScoredFeed>>,
    limit: usize,
}

impl TopK {
    pub fn new(limit: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(limit + 1),
            limit,
        }
    }

    pub fn push(&mut self, entry: ScoredFeed) {
        if self.heap.len() < self.limit {
            self.heap.push(Reverse(entry));
            return;
        }
        if let Some(Reverse(min)) = self.heap.peek() {
            if entry > *min {
                self.heap.pop();
                self.heap.push(Reverse(entry));
            }
        }
    }

    /// Drain into an ordered list, best first
    pub fn into_ranked(mut self) -> Vec<ScoredFeed> {
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some(Reverse(entry)) = self.heap.pop() {
            out.push(entry);
        }
        out.reverse();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[u64]) -> HashSet<u64> {
        values.iter().copied().collect()
    }

    #[test]
    fn test_filter_result_sentinels() {
        let matched = FilterResult::from_ids(ids(&[1, 2]));

        // Unrestricted absorbs into the other side
        assert_eq!(
            FilterResult::Unrestricted.intersect(matched.clone()),
            matched
        );
        assert_eq!(
            matched.clone().intersect(FilterResult::Unrestricted),
            matched
        );

        // Match-nothing is terminal
        let nothing = FilterResult::match_nothing();
        assert!(matched.intersect(nothing).is_match_nothing());

        // Unrestricted on both sides stays unrestricted
        assert_eq!(
            FilterResult::Unrestricted.intersect(FilterResult::Unrestricted),
            FilterResult::Unrestricted
        );
    }

    #[test]
    fn test_intersection_keeps_larger_score() {
        let labels = FilterResult::from_ids(ids(&[1, 2, 3]));
        let vectors = FilterResult::Matched(HashMap::from([(2, 0.8), (3, 0.6), (4, 0.9)]));

        match labels.intersect(vectors) {
            FilterResult::Matched(map) => {
                assert_eq!(map.len(), 2);
                // Label matches carry 1.0, which wins over the vector score here
                assert_eq!(map[&2], 1.0);
                assert_eq!(map[&3], 1.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_topk_ordering_and_eviction() {
        let mut top = TopK::new(2);
        for (id, score, time) in [(1u64, 0.5f32, 10i64), (2, 0.9, 20), (3, 0.7, 30)] {
            top.push(ScoredFeed {
                record: FeedRecord::with_time(id, time),
                score,
            });
        }

        let ranked = top.into_ranked();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].record.id, 2);
        assert_eq!(ranked[1].record.id, 3);
    }

    #[test]
    fn test_topk_tie_breaks_by_recency() {
        let mut top = TopK::new(2);
        for (id, time) in [(1u64, 10i64), (2, 30), (3, 20)] {
            top.push(ScoredFeed {
                record: FeedRecord::with_time(id, time),
                score: 1.0,
            });
        }

        let ranked = top.into_ranked();
        // Equal scores: newest first, the oldest was evicted on overflow
        assert_eq!(ranked[0].record.id, 2);
        assert_eq!(ranked[1].record.id, 3);
    }

    #[test]
    fn test_normalize_defaults() {
        let config = BlockConfig::default();
        let block_range = TimeRange::new(0, 1_000);

        let normalized = QueryOptions::new()
            .normalize(&config, block_range)
            .unwrap();
        assert_eq!(normalized.threshold, config.default_threshold);
        assert_eq!(normalized.limit, config.default_limit);
        assert_eq!(normalized.range, block_range);
        assert!(normalized.query.is_none());
    }

    #[test]
    fn test_normalize_rejects_bad_options() {
        let config = BlockConfig::default();
        let block_range = TimeRange::new(0, 1_000);

        assert!(QueryOptions::new()
            .threshold(1.5)
            .normalize(&config, block_range)
            .is_err());
        assert!(QueryOptions::new()
            .limit(0)
            .normalize(&config, block_range)
            .is_err());
        assert!(QueryOptions::new()
            .filter(LabelFilter::equals("source", "hn"))
            .filter(LabelFilter::equals("source", "rss"))
            .normalize(&config, block_range)
            .is_err());
    }

    #[test]
    fn test_normalize_caps_limit_and_trims_query() {
        let config = BlockConfig::default();
        let block_range = TimeRange::new(0, 1_000);

        let normalized = QueryOptions::new()
            .limit(usize::MAX)
            .semantic("   ")
            .normalize(&config, block_range)
            .unwrap();
        assert_eq!(normalized.limit, config.max_limit);
        // Whitespace-only query text means no semantic pass
        assert!(normalized.query.is_none());
    }
}
