//! Embedding capability seam
//!
//! The engine never talks to a model directly; it consumes an injected
//! [`Embedder`]. Implementations are expected to bring their own batching,
//! caching, and rate limiting - the block only fans calls out and isolates
//! per-record failures.

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by an embedding implementation
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("embedding failed: {0}")]
    Failed(String),

    #[error("embedding input rejected: {0}")]
    InvalidInput(String),
}

/// Opaque text → vectors capability
///
/// One call may return several vectors when the implementation splits long
/// input semantically; every vector must share the model's dimension.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Name of the backing model, recorded in block metadata so a reload can
    /// detect a model swap
    fn model_name(&self) -> &str;

    /// Embed one text into one or more vectors
    async fn embed(&self, text: &str) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Deterministic embedder for tests: hashes bytes into a fixed-dimension
    /// direction so distinct texts get distinct, stable vectors
    pub struct StubEmbedder {
        pub dimension: usize,
    }

    impl StubEmbedder {
        pub fn new(dimension: usize) -> Self {
            Self { dimension }
        }

        pub fn vector_for(&self, text: &str) -> Vec<f32> {
            let mut state = 0xcbf29ce484222325u64;
            for b in text.bytes() {
                state ^= b as u64;
                state = state.wrapping_mul(0x100000001b3);
            }
            let mut out = Vec::with_capacity(self.dimension);
            for i in 0..self.dimension {
                let h = state.rotate_left((i % 64) as u32);
                out.push(((h % 1000) as f32 / 500.0) - 1.0);
            }
            out
        }
    }

    #[async_trait]
    impl Embedder for StubEmbedder {
        fn model_name(&self) -> &str {
            "stub"
        }

        async fn embed(&self, text: &str) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            if text.is_empty() {
                return Err(EmbeddingError::InvalidInput("empty text".to_string()));
            }
            Ok(vec![self.vector_for(text)])
        }
    }

    /// Embedder that always fails, for error-isolation tests
    pub struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        fn model_name(&self) -> &str {
            "failing"
        }

        async fn embed(&self, _text: &str) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Err(EmbeddingError::Failed("model unavailable".to_string()))
        }
    }
}
