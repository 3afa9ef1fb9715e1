//! Middleware Configuration
//!
//! Recognized options, their defaults, and the validation rules that turn a
//! misconfigured middleware into a loud failure instead of silently wrong
//! learning. Two classes of problems:
//!
//! - **Fatal**: an embedder without its dimension (or vice versa), a slate
//!   larger than the candidate pool, non-positive temperature or learning
//!   rate. These fail construction or the first turn.
//! - **Suspicious**: the vector store embeds with a different backend than
//!   the middleware was handed. That earns a warning, because relevance
//!   scores and reranker scores then live in different spaces.

use std::sync::Arc;

use reverie_core::provider::Embedder;
use reverie_core::state::RerankerParams;
use reverie_core::store::VectorStore;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Fatal configuration errors
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// An embedder was provided without its dimension
    #[error("an embedder was configured without `embedding_dimension`; both must be set together")]
    MissingDimension,
    /// A dimension was provided without an embedder
    #[error("`embedding_dimension` was configured without an embedder; both must be set together")]
    MissingEmbedder,
    /// The slate cannot exceed the candidate pool
    #[error("invalid slate: top_m ({top_m}) must not exceed top_k ({top_k})")]
    InvalidSlate {
        /// Configured slate size
        top_m: usize,
        /// Configured candidate pool size
        top_k: usize,
    },
    /// A scalar hyperparameter is out of range
    #[error("invalid hyperparameter: {0}")]
    InvalidParam(String),
    /// The embedder's probe vector disagrees with the configured dimension
    #[error("embedding dimension mismatch: configured {configured}, embedder produced {probed}")]
    DimensionMismatch {
        /// Dimension the middleware was configured with
        configured: usize,
        /// Dimension the embedder actually produced
        probed: usize,
    },
}

// ============================================================================
// OPTIONS
// ============================================================================

/// Recognized middleware options
///
/// `embedder` and `embedding_dimension` must be set together; when neither
/// is set the middleware reuses the vector store's embedder at the default
/// dimension.
#[derive(Clone)]
pub struct MiddlewareOptions {
    /// Embedding backend for queries and candidate re-embedding
    pub embedder: Option<Arc<dyn Embedder>>,
    /// Dimension the reranker weights are square over
    pub embedding_dimension: Option<usize>,
    /// Candidate pool size per query
    pub top_k: usize,
    /// Slate size shown to the generator
    pub top_m: usize,
    /// Gumbel-Softmax temperature
    pub temperature: f32,
    /// REINFORCE step size
    pub learning_rate: f32,
    /// Reward baseline
    pub baseline: f32,
    /// Samples per applied weight update
    pub batch_size: usize,
    /// Gradient / weight clipping threshold
    pub clip_threshold: f32,
    /// Session identifier; a fresh UUID when absent
    pub session_id: Option<String>,
    /// Whether the middleware does anything at all
    pub enabled: bool,
    /// Seed for the sampler and weight init; entropy when absent
    pub seed: Option<u64>,
}

impl std::fmt::Debug for MiddlewareOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareOptions")
            .field("embedding_dimension", &self.embedding_dimension)
            .field("top_k", &self.top_k)
            .field("top_m", &self.top_m)
            .field("temperature", &self.temperature)
            .field("learning_rate", &self.learning_rate)
            .field("baseline", &self.baseline)
            .field("batch_size", &self.batch_size)
            .field("clip_threshold", &self.clip_threshold)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl Default for MiddlewareOptions {
    fn default() -> Self {
        let params = RerankerParams::default();
        Self {
            embedder: None,
            embedding_dimension: None,
            top_k: params.top_k,
            top_m: params.top_m,
            temperature: params.temperature,
            learning_rate: params.learning_rate,
            baseline: params.baseline,
            batch_size: params.batch_size,
            clip_threshold: params.clip_threshold,
            session_id: None,
            enabled: true,
            seed: None,
        }
    }
}

impl MiddlewareOptions {
    /// The reranker parameter record these options describe
    pub fn params(&self) -> RerankerParams {
        RerankerParams {
            top_k: self.top_k,
            top_m: self.top_m,
            temperature: self.temperature,
            learning_rate: self.learning_rate,
            baseline: self.baseline,
            clip_threshold: self.clip_threshold,
            batch_size: self.batch_size,
        }
    }

    /// Validate against the store, resolving the effective embedder and
    /// dimension
    pub fn resolve(
        &self,
        store: &VectorStore,
    ) -> Result<(Arc<dyn Embedder>, usize), ConfigError> {
        match (&self.embedder, self.embedding_dimension) {
            (Some(_), None) => return Err(ConfigError::MissingDimension),
            (None, Some(_)) => return Err(ConfigError::MissingEmbedder),
            _ => {}
        }
        if self.top_m > self.top_k {
            return Err(ConfigError::InvalidSlate {
                top_m: self.top_m,
                top_k: self.top_k,
            });
        }
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(ConfigError::InvalidParam(format!(
                "temperature must be positive and finite, got {}",
                self.temperature
            )));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ConfigError::InvalidParam(format!(
                "learning_rate must be positive and finite, got {}",
                self.learning_rate
            )));
        }
        if !(self.clip_threshold.is_finite() && self.clip_threshold > 0.0) {
            return Err(ConfigError::InvalidParam(format!(
                "clip_threshold must be positive and finite, got {}",
                self.clip_threshold
            )));
        }
        if !self.baseline.is_finite() {
            return Err(ConfigError::InvalidParam(format!(
                "baseline must be finite, got {}",
                self.baseline
            )));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidParam("batch_size must be at least 1".into()));
        }

        let (embedder, dimension) = match (&self.embedder, self.embedding_dimension) {
            (Some(embedder), Some(dimension)) => (Arc::clone(embedder), dimension),
            _ => (store.embedder(), reverie_core::DEFAULT_EMBEDDING_DIMENSION),
        };

        if embedder.identity() != store.embedder_identity() {
            tracing::warn!(
                middleware_embedder = embedder.identity(),
                store_embedder = %store.embedder_identity(),
                "vector store embeds with a different backend than the middleware; \
                 relevance and rerank scores will live in different spaces"
            );
        }

        Ok((embedder, dimension))
    }
}

// ============================================================================
// TESTS
// ============================================================================
