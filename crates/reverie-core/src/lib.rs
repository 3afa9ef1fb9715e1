//! # Reverie Core
//!
//! Reflective memory engine for conversational agents. The data plane behind
//! both halves of reflective memory management:
//!
//! - **Retrospective reflection**: a trainable reranker over retrieved
//!   memories. Query and memory embeddings pass through learned residual
//!   transforms, candidates are sampled with Gumbel-Softmax top-M, and the
//!   generator's citations become REINFORCE rewards.
//! - **Prospective reflection**: extracted memories land in a durable,
//!   journaled vector store that supports delete-and-reinsert merges and
//!   crash-safe recovery.
//!
//! This crate owns the leaves: the dense matrix kernel, the sampler, the
//! citation scanner, the journaled store, the per-user state documents, and
//! the provider traits (`LanguageModel`, `Embedder`, `SessionStore`) that
//! keep real backends out of the engine. The turn pipeline that composes
//! them lives in `reverie-middleware`.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use reverie_core::store::VectorStore;
//! use reverie_core::memory::Document;
//!
//! let store = VectorStore::open("data/memories", embedder).await?;
//! store.add(vec![Document::new("User likes hiking")]).await?;
//! let hits = store.similarity_search("outdoor activities", 5).await?;
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod citation;
pub mod linalg;
pub mod memory;
pub mod provider;
pub mod sampling;
pub mod state;
pub mod store;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Matrix kernel
pub use linalg::{LinalgError, Matrix, dot_clamped, residual_add};

// Gumbel-Softmax sampler
pub use sampling::{SamplingResult, sample_top_m};

// Citation scanner
pub use citation::{CitationOutcome, CitationRecord, parse_citations, records_for_slate};

// Memory types
pub use memory::{Document, MemoryEntry, RetrievedMemory};

// Journaled vector store
pub use store::{
    JournalRecord, PrebuildMarker, StoreError, StoreStats, VectorStore, VectorStoreConfig,
};

// Per-user durable state
pub use state::{
    BufferedMessage, GradientAccumulator, GradientSample, RerankerParams, RerankerWeights,
    SessionMetadata, StateStore,
};

// Provider traits
pub use provider::{
    Block, ChatMessage, Embedder, LanguageModel, MessageRole, ModelOutput, ProviderError,
    SessionStore,
};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Journal schema version written to prebuild markers
pub const JOURNAL_SCHEMA_VERSION: u32 = 1;

/// Default embedding dimension (matches text-embedding-3-small / ada-002)
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 1536;

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        ChatMessage, CitationOutcome, Document, Embedder, GradientAccumulator, GradientSample,
        LanguageModel, Matrix, MemoryEntry, MessageRole, ModelOutput, RerankerParams,
        RerankerWeights, RetrievedMemory, SamplingResult, SessionStore, StateStore, StoreError,
        VectorStore,
    };
}
