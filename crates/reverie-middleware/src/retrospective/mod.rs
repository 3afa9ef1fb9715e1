//! Retrospective Reflection
//!
//! The read-side learning loop: adapt embeddings through the learned
//! residual transforms, score, sample a slate, show it to the generator,
//! and turn the citations that come back into a policy-gradient update.
//!
//! The pieces here are deliberately pure - embedding adaptation, candidate
//! scoring, slate rendering, reward extension, and batch application - so
//! the hooks stay thin and every step is testable without a generator.

mod gradient;

pub use gradient::{ADVANTAGE_EPS, sample_gradient};

use reverie_core::citation::CitationRecord;
use reverie_core::linalg::{LinalgError, Matrix, dot_clamped, residual_add};
use reverie_core::memory::RetrievedMemory;
use reverie_core::provider::ChatMessage;
use reverie_core::state::{GradientAccumulator, RerankerWeights};

// ============================================================================
// EMBEDDING ADAPTATION
// ============================================================================

/// Residual adaptation `v' = v + W v`
pub fn adapt_embedding(transform: &Matrix, v: &[f32]) -> Result<Vec<f32>, LinalgError> {
    let wv = transform.matvec(v)?;
    residual_add(v, &wv)
}

/// Relevance score of every adapted candidate against the adapted query
///
/// Plain dot products with overflow guarding; the sampler takes it from
/// here.
pub fn score_candidates(adapted_query: &[f32], adapted_memories: &[Vec<f32>]) -> Vec<f32> {
    adapted_memories
        .iter()
        .map(|m| dot_clamped(adapted_query, m))
        .collect()
}

// ============================================================================
// SLATE RENDERING
// ============================================================================

/// Render the selected memories as the ephemeral user-role message
///
/// The block is injected after the real conversation and never written
/// back to it. Indices in the block are slate positions, which is what the
/// generator cites.
pub fn slate_message(slate: &[&RetrievedMemory]) -> ChatMessage {
    let mut body = String::from(
        "You have access to the following long-term memories about this user. \
         Use them when they help answer the question.\n\n<memories>\n",
    );
    for (position, memory) in slate.iter().enumerate() {
        body.push_str(&format!(
            "- Memory [{position}]: {}\n    {}\n",
            memory.entry.topic_summary, memory.entry.raw_dialogue
        ));
    }
    body.push_str(
        "</memories>\n\nAfter answering, end your response with the bracketed indices of \
         the memories you actually used, e.g. [0, 2]. If none of them helped, end with \
         [NO_CITE].",
    );
    ChatMessage::user(body)
}

// ============================================================================
// REWARD EXTENSION
// ============================================================================

/// Extend slate rewards to the full candidate pool
///
/// Slate positions map back to candidate indices through
/// `selected_indices`; every candidate outside the slate defaults to `-1`
/// (it was available and went unused).
pub fn rewards_for_candidates(
    candidate_count: usize,
    selected_indices: &[usize],
    citations: &[CitationRecord],
) -> Vec<f32> {
    let mut rewards = vec![-1.0_f32; candidate_count];
    for record in citations {
        if let Some(&candidate) = selected_indices.get(record.turn_index) {
            if candidate < candidate_count {
                rewards[candidate] = record.reward;
            }
        }
    }
    rewards
}

// ============================================================================
// BATCH APPLICATION
// ============================================================================

/// Apply the accumulated batch to the weights and reset the accumulator
///
/// `W <- W + dW`, then element-wise clip into `[-clip, +clip]`. The
/// accumulator's batch index advances and its matrices zero out.
pub fn apply_batch(
    weights: &mut RerankerWeights,
    accumulator: &mut GradientAccumulator,
) -> Result<(), LinalgError> {
    let clip = weights.params.clip_threshold;
    weights.w_query.add_assign(&accumulator.grad_w_query)?;
    weights.w_query.clip_elementwise(-clip, clip);
    weights.w_memory.add_assign(&accumulator.grad_w_memory)?;
    weights.w_memory.clip_elementwise(-clip, clip);
    weights.updated_batches += 1;
    weights.last_updated = chrono::Utc::now();
    accumulator.reset(weights.dimension);
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
