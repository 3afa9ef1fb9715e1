//! Per-User Durable State
//!
//! Everything the reranker learns or buffers for one user, stored as
//! versioned, self-describing JSON documents in the session store:
//!
//! | namespace                          | key              | document              |
//! |------------------------------------|------------------|-----------------------|
//! | `["rmm", user, "weights"]`         | `reranker`       | [`RerankerWeights`]   |
//! | `["rmm", user, "accumulator"]`     | `gradient`       | [`GradientAccumulator`] |
//! | `["rmm", user, "metadata"]`        | `session`        | [`SessionMetadata`]   |
//! | `["rmm", user, "buffer"]`          | `message-buffer` | [`MessageBuffer`]     |
//!
//! Loads return `None` on anything unusable (missing, wrong version, bad
//! shapes, non-finite scalars) and saves return a success flag instead of
//! erroring; a flaky session store degrades the learning loop, it never
//! breaks the turn.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::linalg::Matrix;
use crate::provider::{MessageRole, SessionStore};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Root namespace segment for all reflective-memory state
pub const STATE_NAMESPACE_ROOT: &str = "rmm";

/// Document schema version for every state document
pub const STATE_VERSION: u32 = 1;

/// Message buffer compaction bound; oldest messages drop first
pub const MAX_BUFFERED_MESSAGES: usize = 512;

/// Weight initialization standard deviation
pub const INIT_STD: f32 = 0.01;

// ============================================================================
// RERANKER PARAMETERS
// ============================================================================

/// Learning and sampling hyperparameters, persisted with the weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RerankerParams {
    /// Candidate pool size retrieved per query
    pub top_k: usize,
    /// Slate size shown to the generator (`<= top_k`)
    pub top_m: usize,
    /// Gumbel-Softmax temperature
    pub temperature: f32,
    /// REINFORCE step size
    pub learning_rate: f32,
    /// Reward baseline subtracted for variance reduction
    pub baseline: f32,
    /// L2 clip per sample gradient and element-wise bound on weights
    pub clip_threshold: f32,
    /// Samples accumulated before a weight update applies
    pub batch_size: usize,
}

impl Default for RerankerParams {
    fn default() -> Self {
        Self {
            top_k: 20,
            top_m: 5,
            temperature: 0.5,
            learning_rate: 0.001,
            baseline: 0.5,
            clip_threshold: 100.0,
            batch_size: 4,
        }
    }
}

impl RerankerParams {
    /// Structural soundness: finite, non-negative scalars, a usable slate
    pub fn is_valid(&self) -> bool {
        self.top_m <= self.top_k
            && self.batch_size >= 1
            && self.temperature.is_finite()
            && self.temperature > 0.0
            && self.learning_rate.is_finite()
            && self.learning_rate > 0.0
            && self.baseline.is_finite()
            && self.baseline >= 0.0
            && self.clip_threshold.is_finite()
            && self.clip_threshold > 0.0
    }

    /// Stable short hash for stale-configuration detection
    pub fn config_hash(&self) -> String {
        let canonical = format!(
            "k={};m={};tau={};eta={};b={};clip={};batch={}",
            self.top_k,
            self.top_m,
            self.temperature,
            self.learning_rate,
            self.baseline,
            self.clip_threshold,
            self.batch_size
        );
        let digest = Sha256::digest(canonical.as_bytes());
        digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
    }
}

// ============================================================================
// RERANKER WEIGHTS
// ============================================================================

/// The learned transforms: `W_q` for queries, `W_m` for memories
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RerankerWeights {
    /// Document schema version
    pub version: u32,
    /// Embedding dimension both matrices are square over
    pub dimension: usize,
    /// Query transform
    pub w_query: Matrix,
    /// Memory transform
    pub w_memory: Matrix,
    /// Hyperparameters in force when the weights were created
    pub params: RerankerParams,
    /// Applied batch updates so far
    pub updated_batches: u64,
    /// Last mutation time
    pub last_updated: DateTime<Utc>,
}

impl RerankerWeights {
    /// Fresh weights from `N(0, INIT_STD^2)`
    pub fn init<R: rand::Rng + ?Sized>(
        dimension: usize,
        params: RerankerParams,
        rng: &mut R,
    ) -> Self {
        Self {
            version: STATE_VERSION,
            dimension,
            w_query: Matrix::gaussian(dimension, dimension, 0.0, INIT_STD, rng),
            w_memory: Matrix::gaussian(dimension, dimension, 0.0, INIT_STD, rng),
            params,
            updated_batches: 0,
            last_updated: Utc::now(),
        }
    }

    fn is_valid(&self) -> bool {
        self.version == STATE_VERSION
            && self.params.is_valid()
            && self.w_query.rows() == self.dimension
            && self.w_query.cols() == self.dimension
            && self.w_memory.rows() == self.dimension
            && self.w_memory.cols() == self.dimension
            && self.w_query.is_finite()
            && self.w_memory.is_finite()
    }
}

// ============================================================================
// GRADIENT SAMPLE
// ============================================================================

/// Everything needed to recompute one turn's exact REINFORCE gradient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradientSample {
    /// Raw query embedding `q`
    pub query: Vec<f32>,
    /// Adapted query `q' = q + W_q q`
    pub adapted_query: Vec<f32>,
    /// Raw memory embeddings, one per candidate
    pub memory_embeddings: Vec<Vec<f32>>,
    /// Adapted memory embeddings `m' = m + W_m m`
    pub adapted_memories: Vec<Vec<f32>>,
    /// Sampling probability of every candidate (length K)
    pub sampling_probabilities: Vec<f32>,
    /// Slate drawn from the candidates (size M, subset of `0..K`)
    pub selected_indices: Vec<usize>,
    /// Reward per candidate, `+1.0` or `-1.0` (length K)
    pub citation_rewards: Vec<f32>,
    /// When the turn happened
    pub timestamp: DateTime<Utc>,
}

/// A gradient sample whose shapes disagree with the configured dimension
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("gradient sample shape violation: {0}")]
pub struct ShapeViolation(pub String);

impl GradientSample {
    /// Strict shape validation against the embedding dimension
    pub fn validate(&self, dimension: usize) -> Result<(), ShapeViolation> {
        let k = self.memory_embeddings.len();
        if self.query.len() != dimension {
            return Err(ShapeViolation(format!(
                "query length {} != dimension {dimension}",
                self.query.len()
            )));
        }
        if self.adapted_query.len() != dimension {
            return Err(ShapeViolation(format!(
                "adapted query length {} != dimension {dimension}",
                self.adapted_query.len()
            )));
        }
        if self.adapted_memories.len() != k {
            return Err(ShapeViolation(format!(
                "{} adapted memories for {k} candidates",
                self.adapted_memories.len()
            )));
        }
        for (i, m) in self
            .memory_embeddings
            .iter()
            .chain(self.adapted_memories.iter())
            .enumerate()
        {
            if m.len() != dimension {
                return Err(ShapeViolation(format!(
                    "memory vector {i} has length {} != dimension {dimension}",
                    m.len()
                )));
            }
        }
        if self.sampling_probabilities.len() != k {
            return Err(ShapeViolation(format!(
                "{} probabilities for {k} candidates",
                self.sampling_probabilities.len()
            )));
        }
        if self.citation_rewards.len() != k {
            return Err(ShapeViolation(format!(
                "{} rewards for {k} candidates",
                self.citation_rewards.len()
            )));
        }
        if let Some(&out) = self.selected_indices.iter().find(|&&i| i >= k) {
            return Err(ShapeViolation(format!(
                "selected index {out} outside candidate range 0..{k}"
            )));
        }
        Ok(())
    }
}

// ============================================================================
// GRADIENT ACCUMULATOR
// ============================================================================

/// Running batch of per-turn gradients awaiting application
///
/// The matrices hold the batch MEAN of the (already L2-clipped) sample
/// gradients, so the accumulator's norm never exceeds the clip threshold
/// regardless of batch size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradientAccumulator {
    /// Document schema version
    pub version: u32,
    /// Samples contributing to the pending batch
    pub samples: Vec<GradientSample>,
    /// Mean gradient for `W_q`
    pub grad_w_query: Matrix,
    /// Mean gradient for `W_m`
    pub grad_w_memory: Matrix,
    /// Batches applied so far
    pub last_batch_index: u64,
    /// Last mutation time
    pub last_updated: DateTime<Utc>,
}

impl GradientAccumulator {
    /// An empty accumulator for the given dimension
    pub fn empty(dimension: usize) -> Self {
        Self {
            version: STATE_VERSION,
            samples: Vec::new(),
            grad_w_query: Matrix::zeros(dimension, dimension),
            grad_w_memory: Matrix::zeros(dimension, dimension),
            last_batch_index: 0,
            last_updated: Utc::now(),
        }
    }

    /// Fold one clipped sample gradient into the batch mean
    pub fn accumulate(
        &mut self,
        sample: GradientSample,
        grad_w_query: &Matrix,
        grad_w_memory: &Matrix,
    ) -> Result<(), crate::linalg::LinalgError> {
        let n = (self.samples.len() + 1) as f32;
        self.grad_w_query.scale_assign((n - 1.0) / n);
        self.grad_w_query.add_assign(&grad_w_query.scale(1.0 / n))?;
        self.grad_w_memory.scale_assign((n - 1.0) / n);
        self.grad_w_memory.add_assign(&grad_w_memory.scale(1.0 / n))?;
        self.samples.push(sample);
        self.last_updated = Utc::now();
        Ok(())
    }

    /// Whether the pending batch reached the configured size
    pub fn is_full(&self, batch_size: usize) -> bool {
        self.samples.len() >= batch_size
    }

    /// Zero the matrices and drop the samples after an applied update
    pub fn reset(&mut self, dimension: usize) {
        self.samples.clear();
        self.grad_w_query = Matrix::zeros(dimension, dimension);
        self.grad_w_memory = Matrix::zeros(dimension, dimension);
        self.last_batch_index += 1;
        self.last_updated = Utc::now();
    }

    fn is_valid(&self, _dimension: Option<usize>) -> bool {
        self.version == STATE_VERSION
            && self.grad_w_query.is_finite()
            && self.grad_w_memory.is_finite()
            && self.grad_w_query.rows() == self.grad_w_query.cols()
            && self.grad_w_memory.rows() == self.grad_w_memory.cols()
    }
}

// ============================================================================
// SESSION METADATA & MESSAGE BUFFER
// ============================================================================

/// Durable session bookkeeping for stale-state detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    /// Document schema version
    pub version: u32,
    /// Hash of the reranker parameters in force
    pub config_hash: String,
    /// Completed sessions for this user
    pub session_count: u64,
    /// Last mutation time
    pub last_updated: DateTime<Utc>,
}

impl SessionMetadata {
    /// Fresh metadata for a parameter set
    pub fn new(config_hash: String) -> Self {
        Self {
            version: STATE_VERSION,
            config_hash,
            session_count: 0,
            last_updated: Utc::now(),
        }
    }
}

/// One buffered conversation message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferedMessage {
    /// Speaker role
    pub role: MessageRole,
    /// Message text
    pub content: String,
    /// Turn ordinal within the session
    pub turn: usize,
}

/// Append-only per-session dialogue buffer feeding the memory writer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBuffer {
    /// Document schema version
    pub version: u32,
    /// Buffered messages, oldest first
    pub messages: Vec<BufferedMessage>,
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBuffer {
    /// An empty buffer
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION,
            messages: Vec::new(),
        }
    }

    /// Append messages, compacting oldest-first past the size bound
    pub fn append(&mut self, messages: impl IntoIterator<Item = BufferedMessage>) {
        self.messages.extend(messages);
        if self.messages.len() > MAX_BUFFERED_MESSAGES {
            let excess = self.messages.len() - MAX_BUFFERED_MESSAGES;
            self.messages.drain(0..excess);
        }
    }
}

// ============================================================================
// STATE STORE
// ============================================================================

/// Typed facade over the session store for one user's state documents
#[derive(Clone)]
pub struct StateStore {
    store: Arc<dyn SessionStore>,
    user_id: String,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

impl StateStore {
    /// Bind a session store to one user id
    pub fn new(store: Arc<dyn SessionStore>, user_id: impl Into<String>) -> Self {
        Self {
            store,
            user_id: user_id.into(),
        }
    }

    /// The bound user id
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn namespace(&self, leaf: &str) -> Vec<String> {
        vec![
            STATE_NAMESPACE_ROOT.to_string(),
            self.user_id.clone(),
            leaf.to_string(),
        ]
    }

    async fn load_document<T>(&self, leaf: &str, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let value = match self.store.get(&self.namespace(leaf), key).await {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(user = %self.user_id, leaf, key, %err, "state load failed");
                return None;
            }
        };
        match serde_json::from_value(value) {
            Ok(document) => Some(document),
            Err(err) => {
                tracing::warn!(user = %self.user_id, leaf, key, %err, "state document invalid");
                None
            }
        }
    }

    async fn save_document<T>(&self, leaf: &str, key: &str, document: &T) -> bool
    where
        T: Serialize,
    {
        let value = match serde_json::to_value(document) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(user = %self.user_id, leaf, key, %err, "state serialize failed");
                return false;
            }
        };
        match self.store.put(&self.namespace(leaf), key, value).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(user = %self.user_id, leaf, key, %err, "state save failed");
                false
            }
        }
    }

    /// Load the reranker weights; `None` when absent or invalid
    pub async fn load_weights(&self) -> Option<RerankerWeights> {
        let weights: RerankerWeights = self.load_document("weights", "reranker").await?;
        if !weights.is_valid() {
            tracing::warn!(user = %self.user_id, "rejecting invalid reranker weights document");
            return None;
        }
        Some(weights)
    }

    /// Persist the reranker weights; `false` (with a warning) on failure
    pub async fn save_weights(&self, weights: &RerankerWeights) -> bool {
        if !weights.is_valid() {
            tracing::warn!(user = %self.user_id, "refusing to save invalid reranker weights");
            return false;
        }
        self.save_document("weights", "reranker", weights).await
    }

    /// Load the gradient accumulator
    pub async fn load_accumulator(&self) -> Option<GradientAccumulator> {
        let acc: GradientAccumulator = self.load_document("accumulator", "gradient").await?;
        if !acc.is_valid(None) {
            tracing::warn!(user = %self.user_id, "rejecting invalid accumulator document");
            return None;
        }
        Some(acc)
    }

    /// Persist the gradient accumulator
    pub async fn save_accumulator(&self, accumulator: &GradientAccumulator) -> bool {
        if !accumulator.is_valid(None) {
            tracing::warn!(user = %self.user_id, "refusing to save invalid accumulator");
            return false;
        }
        self.save_document("accumulator", "gradient", accumulator).await
    }

    /// Load session metadata
    pub async fn load_metadata(&self) -> Option<SessionMetadata> {
        let metadata: SessionMetadata = self.load_document("metadata", "session").await?;
        if metadata.version != STATE_VERSION {
            return None;
        }
        Some(metadata)
    }

    /// Persist session metadata
    pub async fn save_metadata(&self, metadata: &SessionMetadata) -> bool {
        self.save_document("metadata", "session", metadata).await
    }

    /// Load the message buffer; an absent buffer is an empty one
    pub async fn load_buffer(&self) -> MessageBuffer {
        match self.load_document::<MessageBuffer>("buffer", "message-buffer").await {
            Some(buffer) if buffer.version == STATE_VERSION => buffer,
            Some(_) | None => MessageBuffer::new(),
        }
    }

    /// Persist the message buffer
    pub async fn save_buffer(&self, buffer: &MessageBuffer) -> bool {
        self.save_document("buffer", "message-buffer", buffer).await
    }

    /// Drop the message buffer (end of session)
    pub async fn clear_buffer(&self) -> bool {
        match self
            .store
            .delete(&self.namespace("buffer"), "message-buffer")
            .await
        {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(user = %self.user_id, %err, "buffer clear failed");
                false
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
