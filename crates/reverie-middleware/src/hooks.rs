//! Lifecycle Hooks
//!
//! The five hooks composing one agent turn, in call order:
//!
//! 1. `before_agent` - rehydrate the user's weights, accumulator, and
//!    message buffer from the session store.
//! 2. `before_model` - lazy dimension probe, query extraction, top-K
//!    retrieval, candidate re-embedding; stash it all in the turn context.
//! 3. `wrap_model_call` - the hot path: adapt, score, sample, inject the
//!    ephemeral memory slate, call the generator, parse citations.
//! 4. `after_model` - build the gradient sample, accumulate, apply batches,
//!    persist; always clears the turn context, success or not.
//! 5. `after_agent` - append the turn to the durable dialogue buffer and,
//!    at session end, fire the prospective writer.
//!
//! A disabled middleware turns every hook into a no-op passthrough. No
//! generator misbehavior and no backend outage ever blocks the turn: the
//! worst case is a turn without memory injection and without a learning
//! update.

use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use uuid::Uuid;

use reverie_core::citation::{parse_citations, records_for_slate};
use reverie_core::provider::{
    ChatMessage, Embedder, LanguageModel, MessageRole, ModelOutput, SessionStore,
};
use reverie_core::sampling::sample_top_m;
use reverie_core::state::{
    GradientAccumulator, GradientSample, MessageBuffer, BufferedMessage, RerankerParams,
    RerankerWeights, SessionMetadata, StateStore,
};
use reverie_core::store::VectorStore;

use crate::config::{ConfigError, MiddlewareOptions};
use crate::context::TurnContext;
use crate::prospective::ProspectiveWriter;
use crate::retrospective::{
    adapt_embedding, apply_batch, rewards_for_candidates, sample_gradient, score_candidates,
    slate_message,
};
use crate::{MiddlewareError, Result};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Text embedded once per session to verify the embedder's dimension
const PROBE_TEXT: &str = "dimension probe";

// ============================================================================
// SESSION
// ============================================================================

/// Per-user, per-session state threaded through the hooks
///
/// One turn at a time: the turn context is created by `before_model`,
/// enriched by `wrap_model_call`, and consumed (taken) by `after_model`, so
/// a cancelled turn leaves nothing behind.
#[derive(Debug)]
pub struct MemorySession {
    user_id: String,
    session_id: String,
    turn_counter: usize,
    dimension_checked: bool,
    weights: Option<RerankerWeights>,
    accumulator: Option<GradientAccumulator>,
    buffer: MessageBuffer,
    turn: Option<TurnContext>,
}

impl MemorySession {
    fn new(user_id: String, session_id: String) -> Self {
        Self {
            user_id,
            session_id,
            turn_counter: 0,
            dimension_checked: false,
            weights: None,
            accumulator: None,
            buffer: MessageBuffer::new(),
            turn: None,
        }
    }

    /// The user this session belongs to
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The session identifier
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Turns seen so far (increments on every `before_model`)
    pub fn turn_counter(&self) -> usize {
        self.turn_counter
    }

    /// The loaded reranker weights, once `before_agent` ran
    pub fn weights(&self) -> Option<&RerankerWeights> {
        self.weights.as_ref()
    }

    /// The pending gradient batch
    pub fn accumulator(&self) -> Option<&GradientAccumulator> {
        self.accumulator.as_ref()
    }

    /// The rehydrated dialogue buffer
    pub fn buffer(&self) -> &MessageBuffer {
        &self.buffer
    }

    /// The live turn context, between `before_model` and `after_model`
    pub fn turn(&self) -> Option<&TurnContext> {
        self.turn.as_ref()
    }
}

// ============================================================================
// MIDDLEWARE
// ============================================================================

/// Reflective memory middleware
///
/// Owns the shared services (store, generator, embedder, session store)
/// and the configuration; per-user state lives in [`MemorySession`] values
/// handed into every hook.
pub struct ReflectiveMemory {
    store: Arc<VectorStore>,
    session_store: Arc<dyn SessionStore>,
    embedder: Arc<dyn Embedder>,
    writer: ProspectiveWriter,
    dimension: usize,
    params: RerankerParams,
    enabled: bool,
    default_session_id: Option<String>,
    rng: Mutex<StdRng>,
}

impl std::fmt::Debug for ReflectiveMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReflectiveMemory")
            .field("dimension", &self.dimension)
            .field("params", &self.params)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl ReflectiveMemory {
    /// Validate the options and assemble the middleware
    pub fn new(
        store: Arc<VectorStore>,
        session_store: Arc<dyn SessionStore>,
        model: Arc<dyn LanguageModel>,
        options: MiddlewareOptions,
    ) -> std::result::Result<Self, ConfigError> {
        let (embedder, dimension) = options.resolve(&store)?;
        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let writer = ProspectiveWriter::new(model, Arc::clone(&store));
        Ok(Self {
            store,
            session_store,
            embedder,
            writer,
            dimension,
            params: options.params(),
            enabled: options.enabled,
            default_session_id: options.session_id.clone(),
            rng: Mutex::new(rng),
        })
    }

    /// Whether the hooks do anything
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The embedding dimension in force
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Start a session for a user
    pub fn session(&self, user_id: impl Into<String>) -> MemorySession {
        let session_id = self
            .default_session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        MemorySession::new(user_id.into(), session_id)
    }

    fn state_for(&self, user_id: &str) -> StateStore {
        StateStore::new(Arc::clone(&self.session_store), user_id)
    }

    // ------------------------------------------------------------------
    // Hook 1: before_agent
    // ------------------------------------------------------------------

    /// Rehydrate weights, accumulator, and buffer for the user
    pub async fn before_agent(&self, session: &mut MemorySession) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let state = self.state_for(&session.user_id);

        let weights = match state.load_weights().await {
            Some(weights) if weights.dimension == self.dimension => weights,
            Some(stale) => {
                tracing::warn!(
                    user = %session.user_id,
                    stored = stale.dimension,
                    configured = self.dimension,
                    "persisted weights have a different dimension; reinitializing"
                );
                self.init_weights(&state).await
            }
            None => self.init_weights(&state).await,
        };

        let accumulator = match state.load_accumulator().await {
            Some(acc) if acc.grad_w_query.rows() == self.dimension => acc,
            Some(_) => GradientAccumulator::empty(self.dimension),
            None => GradientAccumulator::empty(self.dimension),
        };

        let config_hash = self.params.config_hash();
        let metadata = match state.load_metadata().await {
            Some(mut metadata) => {
                if metadata.config_hash != config_hash {
                    tracing::warn!(
                        user = %session.user_id,
                        stored = %metadata.config_hash,
                        current = %config_hash,
                        "reranker parameters changed since this store was trained"
                    );
                    metadata.config_hash = config_hash;
                    metadata.last_updated = Utc::now();
                }
                metadata
            }
            None => SessionMetadata::new(config_hash),
        };
        if !state.save_metadata(&metadata).await {
            tracing::warn!(user = %session.user_id, "session metadata save failed");
        }

        session.buffer = state.load_buffer().await;
        session.weights = Some(weights);
        session.accumulator = Some(accumulator);
        tracing::debug!(
            user = %session.user_id,
            session = %session.session_id,
            buffered = session.buffer.messages.len(),
            "session state rehydrated"
        );
        Ok(())
    }

    async fn init_weights(&self, state: &StateStore) -> RerankerWeights {
        let weights = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            RerankerWeights::init(self.dimension, self.params.clone(), &mut *rng)
        };
        if !state.save_weights(&weights).await {
            tracing::warn!(user = %state.user_id(), "initial weight save failed; continuing in memory");
        }
        weights
    }

    // ------------------------------------------------------------------
    // Hook 2: before_model
    // ------------------------------------------------------------------

    /// Probe the embedder (once), retrieve candidates for the last user
    /// message, and open the turn context
    ///
    /// The turn counter increments on every path through this hook.
    pub async fn before_model(
        &self,
        session: &mut MemorySession,
        messages: &[ChatMessage],
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let result = self.before_model_inner(session, messages).await;
        session.turn_counter += 1;
        result
    }

    async fn before_model_inner(
        &self,
        session: &mut MemorySession,
        messages: &[ChatMessage],
    ) -> Result<()> {
        if !session.dimension_checked {
            match self.embedder.embed_query(PROBE_TEXT).await {
                Ok(probe) if probe.len() == self.dimension => {
                    session.dimension_checked = true;
                }
                Ok(probe) => {
                    return Err(MiddlewareError::Config(ConfigError::DimensionMismatch {
                        configured: self.dimension,
                        probed: probe.len(),
                    }));
                }
                Err(err) => {
                    tracing::warn!(%err, "dimension probe failed; will retry next turn");
                }
            }
        }

        let Some(query) = messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.clone())
        else {
            return Ok(());
        };

        let query_embedding = match self.embedder.embed_query(&query).await {
            Ok(vector) => vector,
            Err(err) => {
                tracing::warn!(%err, "query embedding failed; turn runs without memories");
                return Ok(());
            }
        };

        let retrieved = match self.store.similarity_search(&query, self.params.top_k).await {
            Ok(retrieved) => retrieved,
            Err(err) => {
                tracing::warn!(%err, "retrieval failed; turn runs without memories");
                return Ok(());
            }
        };

        let mut turn = TurnContext::for_query(query, query_embedding);
        if !retrieved.is_empty() {
            // The store never returns vectors; re-embed the summaries to
            // get the raw memory embeddings the gradient needs.
            let summaries: Vec<String> = retrieved
                .iter()
                .map(|m| m.entry.topic_summary.clone())
                .collect();
            match self.embedder.embed_documents(&summaries).await {
                Ok(vectors) if vectors.len() == retrieved.len() => {
                    turn.retrieved = retrieved;
                    turn.memory_embeddings = vectors;
                }
                Ok(vectors) => {
                    tracing::warn!(
                        expected = retrieved.len(),
                        got = vectors.len(),
                        "candidate re-embedding count mismatch; turn runs without memories"
                    );
                }
                Err(err) => {
                    tracing::warn!(%err, "candidate re-embedding failed; turn runs without memories");
                }
            }
        }
        session.turn = Some(turn);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Hook 3: wrap_model_call
    // ------------------------------------------------------------------

    /// The turn hot path
    ///
    /// Adapts embeddings through the learned transforms, samples the slate,
    /// injects it as an ephemeral user message, runs the generator, and
    /// parses the citations out of its answer. The injected message is
    /// never written back to the durable conversation.
    pub async fn wrap_model_call<F, Fut>(
        &self,
        session: &mut MemorySession,
        messages: Vec<ChatMessage>,
        handler: F,
    ) -> Result<ModelOutput>
    where
        F: FnOnce(Vec<ChatMessage>) -> Fut,
        Fut: Future<Output = reverie_core::provider::Result<ModelOutput>>,
    {
        if !self.enabled {
            return Ok(handler(messages).await?);
        }
        let (Some(weights), Some(turn_ref)) = (session.weights.as_ref(), session.turn.as_ref())
        else {
            return Ok(handler(messages).await?);
        };
        if turn_ref.retrieved.is_empty() {
            return Ok(handler(messages).await?);
        }

        // Adaptation: q' = q + W_q q, m' = m + W_m m, scored by dot product
        let (adapted_query, adapted_memories, scores) = match self.adapt_turn(turn_ref, weights) {
            Ok(parts) => parts,
            Err(err) => {
                tracing::warn!(%err, "embedding adaptation failed; turn contributes no gradient");
                session.turn = None;
                return Ok(handler(messages).await?);
            }
        };

        let sampling = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            sample_top_m(&scores, self.params.top_m, self.params.temperature, &mut *rng)
        };

        // Render the slate and release the turn borrow before suspending on
        // the generator.
        let (slate_ids, injected) = {
            let Some(turn) = session.turn.as_mut() else {
                return Ok(handler(messages).await?);
            };
            for (memory, &score) in turn.retrieved.iter_mut().zip(scores.iter()) {
                memory.rerank_score = Some(score);
            }
            let slate: Vec<_> = sampling
                .selected_indices
                .iter()
                .map(|&i| &turn.retrieved[i])
                .collect();
            let slate_ids: Vec<String> = slate.iter().map(|m| m.entry.id.clone()).collect();
            tracing::debug!(
                candidates = turn.retrieved.len(),
                slate = slate.len(),
                "injecting memory slate"
            );
            (slate_ids, slate_message(&slate))
        };

        let mut augmented = messages;
        augmented.push(injected);

        let output = match handler(augmented).await {
            Ok(output) => output,
            Err(err) => {
                session.turn = None;
                return Err(err.into());
            }
        };

        let outcome = parse_citations(output.as_text(), slate_ids.len());
        let citations = records_for_slate(&outcome, &slate_ids);

        if let Some(turn) = session.turn.as_mut() {
            turn.adapted_query = adapted_query;
            turn.adapted_memories = adapted_memories;
            turn.probabilities = sampling.probabilities;
            turn.selected_indices = sampling.selected_indices;
            turn.citation_outcome = Some(outcome);
            turn.citations = citations;
        }
        Ok(output)
    }

    #[allow(clippy::type_complexity)]
    fn adapt_turn(
        &self,
        turn: &TurnContext,
        weights: &RerankerWeights,
    ) -> std::result::Result<(Vec<f32>, Vec<Vec<f32>>, Vec<f32>), reverie_core::linalg::LinalgError>
    {
        let adapted_query = adapt_embedding(&weights.w_query, &turn.query_embedding)?;
        let adapted_memories = turn
            .memory_embeddings
            .iter()
            .map(|m| adapt_embedding(&weights.w_memory, m))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let scores = score_candidates(&adapted_query, &adapted_memories);
        Ok((adapted_query, adapted_memories, scores))
    }

    // ------------------------------------------------------------------
    // Hook 4: after_model
    // ------------------------------------------------------------------

    /// Turn the citations into a gradient and fold it into the batch
    ///
    /// The turn context is taken at entry, so it is cleared no matter how
    /// this hook exits. Applies the batch when it is full or the session
    /// is ending, then persists.
    pub async fn after_model(&self, session: &mut MemorySession, is_session_end: bool) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let Some(turn) = session.turn.take() else {
            return Ok(());
        };
        if turn.citations.is_empty() || !turn.has_sampling_state() {
            tracing::debug!("no citation signal this turn; skipping update");
            return Ok(());
        }

        let rewards = rewards_for_candidates(
            turn.memory_embeddings.len(),
            &turn.selected_indices,
            &turn.citations,
        );
        let sample = GradientSample {
            query: turn.query_embedding,
            adapted_query: turn.adapted_query,
            memory_embeddings: turn.memory_embeddings,
            adapted_memories: turn.adapted_memories,
            sampling_probabilities: turn.probabilities,
            selected_indices: turn.selected_indices,
            citation_rewards: rewards,
            timestamp: Utc::now(),
        };
        if let Err(violation) = sample.validate(self.dimension) {
            tracing::warn!(%violation, "dropping gradient sample with inconsistent shapes");
            return Ok(());
        }

        let (mut grad_w_query, mut grad_w_memory) = match sample_gradient(&sample, &self.params) {
            Ok(grads) => grads,
            Err(err) => {
                tracing::warn!(%err, "gradient computation failed; turn contributes no update");
                return Ok(());
            }
        };
        grad_w_query.clip_l2(self.params.clip_threshold);
        grad_w_memory.clip_l2(self.params.clip_threshold);

        let should_apply = {
            let accumulator = session
                .accumulator
                .get_or_insert_with(|| GradientAccumulator::empty(self.dimension));
            if let Err(err) = accumulator.accumulate(sample, &grad_w_query, &grad_w_memory) {
                tracing::warn!(%err, "gradient accumulation failed; dropping sample");
                return Ok(());
            }
            accumulator.is_full(self.params.batch_size) || is_session_end
        };

        let state = self.state_for(&session.user_id);
        if should_apply {
            self.apply_and_persist(session, &state).await;
        } else if let Some(accumulator) = session.accumulator.as_ref() {
            if !state.save_accumulator(accumulator).await {
                tracing::warn!(user = %session.user_id, "accumulator save failed; batch kept in memory");
            }
        }
        Ok(())
    }

    /// Apply the pending batch and persist weights + accumulator
    async fn apply_and_persist(&self, session: &mut MemorySession, state: &StateStore) {
        let (Some(weights), Some(accumulator)) =
            (session.weights.as_mut(), session.accumulator.as_mut())
        else {
            return;
        };
        if accumulator.samples.is_empty() {
            return;
        }
        let batch = accumulator.samples.len();
        if let Err(err) = apply_batch(weights, accumulator) {
            tracing::warn!(%err, "batch application failed; weights unchanged");
            return;
        }
        tracing::info!(
            user = %session.user_id,
            batch,
            batches_applied = weights.updated_batches,
            "reranker weights updated"
        );
        state.save_weights(weights).await;
        state.save_accumulator(accumulator).await;
    }

    // ------------------------------------------------------------------
    // Hook 5: after_agent
    // ------------------------------------------------------------------

    /// Append the turn's dialogue to the durable buffer; at session end,
    /// flush pending gradients and fire the memory write pipeline
    pub async fn after_agent(
        &self,
        session: &mut MemorySession,
        turn_messages: &[ChatMessage],
        is_session_end: bool,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let turn = session.turn_counter.saturating_sub(1);
        session.buffer.append(
            turn_messages
                .iter()
                .filter(|m| m.role != MessageRole::System)
                .map(|m| BufferedMessage {
                    role: m.role,
                    content: m.content.clone(),
                    turn,
                }),
        );
        let state = self.state_for(&session.user_id);
        state.save_buffer(&session.buffer).await;

        if !is_session_end {
            return Ok(());
        }

        // Session end: flush any partial gradient batch, then write memories
        self.apply_and_persist(session, &state).await;

        let report = self.writer.run(&session.session_id, &session.buffer).await;
        tracing::debug!(
            user = %session.user_id,
            extracted = report.extracted,
            added = report.added,
            merged = report.merged,
            "session memories written"
        );

        let mut metadata = state
            .load_metadata()
            .await
            .unwrap_or_else(|| SessionMetadata::new(self.params.config_hash()));
        metadata.session_count += 1;
        metadata.last_updated = Utc::now();
        state.save_metadata(&metadata).await;

        session.buffer = MessageBuffer::new();
        state.clear_buffer().await;
        Ok(())
    }
}
