//! Provider Traits
//!
//! The three narrow seams through which the engine reaches the outside
//! world: the chat generator, the embedding backend, and the key-value
//! session store. Real providers, mocks, and oracle retrievers all live
//! behind these traits; the engine never links a backend directly.

mod embedder;
mod model;
mod session;

pub use embedder::Embedder;
pub use model::{Block, ChatMessage, LanguageModel, MessageRole, ModelOutput};
pub use session::SessionStore;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Provider error type
///
/// Providers collapse backend-specific failures into this one shape; the
/// engine only ever distinguishes "the call failed" from "the payload did
/// not deserialize".
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The backend call failed (network, auth, rate limit, ...)
    #[error("provider backend error: {0}")]
    Backend(String),
    /// A payload failed to (de)serialize
    #[error("provider serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Provider result type
pub type Result<T> = std::result::Result<T, ProviderError>;
