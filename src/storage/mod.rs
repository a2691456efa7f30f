//! Feed storage primitives
//!
//! Leaf components of the engine:
//! - [`types`]: `FeedRecord`, `Label`, `FeedRef`, `TimeRange`
//! - [`codec`]: self-checksummed record frames
//! - [`chunk`]: append-only chunk files (buffered read-write, mmap read-only)
//! - [`error`]: the `StorageError` taxonomy

pub mod chunk;
pub mod codec;
pub mod error;
pub mod types;

pub use chunk::{ChunkFile, CHUNK_HEADER_SIZE};
pub use codec::{decode_record, encode_record, validate_frame};
pub use error::{StorageError, StorageResult};
pub use types::{FeedRecord, FeedRef, Label, TimeRange};
