//! Exact REINFORCE Gradient
//!
//! The policy is the Gumbel-Softmax slate draw; the action is the selected
//! subset; the reward is the generator's citation verdict per memory. With
//! advantage `A_i = R_i - b` and `I_i = 1[i selected]`, the per-candidate
//! contributions are
//!
//! ```text
//! dW_q += eta * A_i * (I_i - P_i) * (m'_i - E[m'])  (x)  q'
//! dW_m += eta * A_i * (I_i - P_i) *  q'             (x)  (m_i - E[m])
//! ```
//!
//! where `E[m'] = sum_j P_j m'_j` and `E[m] = sum_j P_j m_j` over the whole
//! candidate pool. Because `q'` is constant across candidates, both sums
//! factor into a single outer product: accumulate the weighted embedding
//! residuals first, then take one `D x D` product per matrix.

use reverie_core::linalg::{LinalgError, Matrix, vec_sub};
use reverie_core::state::{GradientSample, RerankerParams};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Candidates with `|A_i|` below this contribute nothing
pub const ADVANTAGE_EPS: f32 = 1e-9;

// ============================================================================
// GRADIENT
// ============================================================================

/// Compute one turn's `(dW_q, dW_m)` from a validated gradient sample
///
/// Shapes must already have passed [`GradientSample::validate`]; this
/// function still fails on internal length disagreement rather than
/// producing a silently wrong update.
pub fn sample_gradient(
    sample: &GradientSample,
    params: &RerankerParams,
) -> Result<(Matrix, Matrix), LinalgError> {
    let k = sample.memory_embeddings.len();
    let d = sample.adapted_query.len();

    if k == 0 {
        return Ok((Matrix::zeros(d, d), Matrix::zeros(d, d)));
    }

    // E[m] and E[m'] under the sampling distribution
    let mut expected_raw = vec![0.0_f32; d];
    let mut expected_adapted = vec![0.0_f32; d];
    for (j, p) in sample.sampling_probabilities.iter().enumerate() {
        for t in 0..d {
            expected_raw[t] += p * sample.memory_embeddings[j][t];
            expected_adapted[t] += p * sample.adapted_memories[j][t];
        }
    }

    let mut selected = vec![false; k];
    for &i in &sample.selected_indices {
        selected[i] = true;
    }

    // Weighted residual sums; q' factors out of both outer products
    let mut adapted_residual_sum = vec![0.0_f32; d];
    let mut raw_residual_sum = vec![0.0_f32; d];
    let mut contributed = false;
    for i in 0..k {
        let advantage = sample.citation_rewards[i] - params.baseline;
        if advantage.abs() < ADVANTAGE_EPS {
            continue;
        }
        let indicator = if selected[i] { 1.0 } else { 0.0 };
        let coeff = params.learning_rate * advantage * (indicator - sample.sampling_probabilities[i]);
        if coeff == 0.0 {
            continue;
        }
        contributed = true;
        let adapted_residual = vec_sub(&sample.adapted_memories[i], &expected_adapted)?;
        let raw_residual = vec_sub(&sample.memory_embeddings[i], &expected_raw)?;
        for t in 0..d {
            adapted_residual_sum[t] += coeff * adapted_residual[t];
            raw_residual_sum[t] += coeff * raw_residual[t];
        }
    }

    if !contributed {
        return Ok((Matrix::zeros(d, d), Matrix::zeros(d, d)));
    }

    let grad_w_query = Matrix::outer(&adapted_residual_sum, &sample.adapted_query);
    let grad_w_memory = Matrix::outer(&sample.adapted_query, &raw_residual_sum);
    Ok((grad_w_query, grad_w_memory))
}

// ============================================================================
// TESTS
// ============================================================================
