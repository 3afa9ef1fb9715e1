//! Embedding Backend Interface
//!
//! Query and document embedding with one contract: every vector a backend
//! returns has the same length, and `embed_documents` returns exactly one
//! vector per input. Dimension agreement with the configured reranker is
//! checked lazily by the middleware (a single short probe on first use), so
//! mock embedders that never embed cost nothing.

use async_trait::async_trait;

use super::Result;

/// An embedding backend
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single query string
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of documents, one vector per input, in order
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Stable identifier for mismatch diagnostics (model name, endpoint, ...)
    fn identity(&self) -> &str {
        "embedder"
    }
}
