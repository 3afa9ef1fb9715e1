//! # Reverie Middleware
//!
//! The turn pipeline of reflective memory management. Five lifecycle hooks
//! wrap an agent's model call and give it a memory that learns from its
//! own behavior:
//!
//! - **Retrospective**: retrieved memories pass through learned residual
//!   transforms, a Gumbel-Softmax draw picks the slate the generator sees,
//!   and the citations in its answer drive a REINFORCE update of the
//!   transforms - batched, clipped, and persisted per user.
//! - **Prospective**: when a session ends, the buffered dialogue goes
//!   through extraction and merge-or-add decisions into the journaled
//!   vector store.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use reverie_middleware::{MiddlewareOptions, ReflectiveMemory};
//!
//! let memory = ReflectiveMemory::new(store, session_store, model, MiddlewareOptions::default())?;
//! let mut session = memory.session("user-42");
//!
//! memory.before_agent(&mut session).await?;
//! loop {
//!     memory.before_model(&mut session, &messages).await?;
//!     let output = memory
//!         .wrap_model_call(&mut session, messages.clone(), |m| generator.call(m))
//!         .await?;
//!     memory.after_model(&mut session, false).await?;
//!     memory.after_agent(&mut session, &turn_messages, is_last_turn).await?;
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod config;
pub mod context;
pub mod hooks;
pub mod prebuild;
pub mod prospective;
pub mod retrospective;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use config::{ConfigError, MiddlewareOptions};
pub use context::TurnContext;
pub use hooks::{MemorySession, ReflectiveMemory};
pub use prebuild::{PrebuildPlan, PrebuildRunner, SessionDialogue};
pub use prospective::{ProspectiveWriter, WriteReport};
pub use retrospective::{sample_gradient, ADVANTAGE_EPS};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Middleware error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum MiddlewareError {
    /// Fatal misconfiguration
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    /// The vector store failed
    #[error(transparent)]
    Store(#[from] reverie_core::store::StoreError),
    /// A provider call failed
    #[error(transparent)]
    Provider(#[from] reverie_core::provider::ProviderError),
}

/// Middleware result type
pub type Result<T> = std::result::Result<T, MiddlewareError>;
