//! Store Module
//!
//! Durable memory persistence:
//! - Append-only NDJSON journal as the single source of truth
//! - In-memory index rebuilt as the fold of the journal
//! - Single-writer queue for ordered, crash-safe mutation
//! - Exact cosine top-K search
//! - Prebuild progress / completion markers

mod journal;
mod prebuild;
mod vector_store;

pub use journal::{JournalRecord, load_journal};
pub use prebuild::PrebuildMarker;
pub use vector_store::{
    DEFAULT_QUERY_CACHE_SIZE, StoreError, StoreStats, VectorStore, VectorStoreConfig,
};

pub use vector_store::Result;
