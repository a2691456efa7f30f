//! # Feedstore
//!
//! Embedded storage engine for time-windowed feed records - an append-only
//! checksummed chunk log with primary, inverted-label, and vector indexes,
//! organized into blocks with a Hot/Cold lifecycle.
//!
//! ## Features
//!
//! - **Durable log**: every record lives in a CRC32-framed chunk file; torn
//!   tails are truncated on recovery, interior corruption is surfaced
//! - **Three-way queries**: exact label predicates, semantic similarity over
//!   injected embeddings, and time windows, combined in one ranked pass
//! - **Hot/Cold blocks**: the active window stays fully resident and
//!   writable; archived blocks release memory and reload transparently
//! - **Batched writes**: an intake queue and writer pool group appends into
//!   single durable writes with bounded retries
//!
//! ## Modules
//!
//! - [`storage`]: record types, frame codec, chunk files
//! - [`index`]: primary, inverted, and vector indexes
//! - [`block`]: block lifecycle, write pipeline, query execution
//! - [`embedding`]: the injected text-to-vector capability
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use feedstore::{Block, BlockConfig, FeedRecord, QueryOptions};
//! use std::sync::Arc;
//!
//! # struct MyEmbedder;
//! # #[async_trait::async_trait]
//! # impl feedstore::Embedder for MyEmbedder {
//! #     fn model_name(&self) -> &str { "my-model" }
//! #     async fn embed(&self, _: &str) -> Result<Vec<Vec<f32>>, feedstore::EmbeddingError> {
//! #         Ok(vec![vec![0.0; 4]])
//! #     }
//! # }
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let day = 24 * 3600 * 1_000_000_000i64;
//!     let block = Block::open(
//!         "data/blocks/0",
//!         0,
//!         day,
//!         BlockConfig::default(),
//!         Arc::new(MyEmbedder),
//!     )?;
//!     block.run();
//!     block.wait_ready().await;
//!
//!     block
//!         .append(vec![FeedRecord::new(1)
//!             .label("source", "hn")
//!             .label("title", "borrow checker internals")])
//!         .await?;
//!
//!     let hits = block
//!         .query(QueryOptions::new().semantic("rust compiler"))
//!         .await?;
//!     println!("{} hits", hits.len());
//!
//!     block.close().await;
//!     Ok(())
//! }
//! ```

pub mod block;
pub mod embedding;
pub mod index;
pub mod storage;

// Re-export top-level types for convenience
pub use block::{
    Block, BlockConfig, BlockMeta, BlockState, BlockStats, FilterResult, QueryOptions, ScoredFeed,
};

pub use embedding::{Embedder, EmbeddingError};

pub use index::{
    cosine_similarity, IndexSet, InvertedIndex, LabelFilter, PrimaryIndex, VectorIndex,
};

pub use storage::{
    decode_record, encode_record, validate_frame, ChunkFile, FeedRecord, FeedRef, Label,
    StorageError, StorageResult, TimeRange,
};
