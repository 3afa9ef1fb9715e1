//! Session Store Interface
//!
//! Namespaced key-value persistence for everything the engine keeps per
//! user: reranker weights, the gradient accumulator, session metadata, and
//! the message buffer. A namespace is an ordered tuple of strings, e.g.
//! `["rmm", user_id, "weights"]`.
//!
//! Callers treat `get -> mutate -> put` as a non-transactional
//! read-modify-write; with per-user serial turns (the natural agent model)
//! the last save simply wins, and every stored blob is self-describing so a
//! stale overwrite can never corrupt state.

use async_trait::async_trait;
use serde_json::Value;

use super::Result;

/// A namespaced key-value store
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch a value; `None` when absent
    async fn get(&self, namespace: &[String], key: &str) -> Result<Option<Value>>;

    /// Store a value, overwriting any existing entry
    async fn put(&self, namespace: &[String], key: &str, value: Value) -> Result<()>;

    /// Remove a value; removing an absent key is not an error
    async fn delete(&self, namespace: &[String], key: &str) -> Result<()>;
}
