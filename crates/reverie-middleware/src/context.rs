//! Per-Turn Context
//!
//! Everything the hooks hand each other within one turn: the query and its
//! embedding from `before_model`, the adapted embeddings, probabilities and
//! citations from `wrap_model_call`, consumed (and thereby cleared) by
//! `after_model`. Constructed fresh every turn; never shared across turns;
//! taken out of the session at the start of `after_model` so it is gone
//! even when the update path bails early.

use reverie_core::citation::{CitationOutcome, CitationRecord};
use reverie_core::memory::RetrievedMemory;

/// Turn-scoped working state
#[derive(Debug, Clone, Default)]
pub struct TurnContext {
    /// Last user message of the turn
    pub query_text: String,
    /// Raw query embedding `q`
    pub query_embedding: Vec<f32>,
    /// Candidates retrieved for the query, in relevance order
    pub retrieved: Vec<RetrievedMemory>,
    /// Raw candidate embeddings `m_i`, re-embedded from the summaries
    pub memory_embeddings: Vec<Vec<f32>>,
    /// Adapted query `q'`, filled by the model-call wrapper
    pub adapted_query: Vec<f32>,
    /// Adapted candidate embeddings `m'_i`
    pub adapted_memories: Vec<Vec<f32>>,
    /// Sampling probabilities over all candidates
    pub probabilities: Vec<f32>,
    /// Slate drawn for injection, as candidate indices
    pub selected_indices: Vec<usize>,
    /// Parsed citation marker, once the generator answered
    pub citation_outcome: Option<CitationOutcome>,
    /// Per-slate-position reward records; empty when the marker was
    /// malformed
    pub citations: Vec<CitationRecord>,
}

impl TurnContext {
    /// Context for a fresh query
    pub fn for_query(query_text: String, query_embedding: Vec<f32>) -> Self {
        Self {
            query_text,
            query_embedding,
            ..Self::default()
        }
    }

    /// Whether the wrapper filled the sampling state needed for a gradient
    pub fn has_sampling_state(&self) -> bool {
        !self.selected_indices.is_empty()
            && !self.probabilities.is_empty()
            && !self.adapted_query.is_empty()
    }
}
