//! Gumbel-Softmax Top-M Sampling
//!
//! Stochastic subset selection over scored candidates:
//!
//! 1. Perturb each score with Gumbel noise `g = -ln(-ln u)`, annealed by the
//!    temperature: the softmax logits are `s/tau + g`.
//! 2. Max-shifted softmax over the logits.
//! 3. Draw M distinct indices without replacement by CDF sampling,
//!    renormalizing the remaining mass after each draw.
//!
//! The returned probability vector always covers ALL candidates and sums to
//! one; the reranker's policy gradient needs the full distribution, not just
//! the winners. Temperature controls exploration: as `tau -> 0` the noise
//! vanishes relative to the scaled scores and selection pins to the argmax
//! score; as `tau -> inf` the scores vanish and selection goes uniform.

use rand::Rng;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Uniform draws are confined to `(EPS, 1 - EPS)` so the double log stays finite
const UNIFORM_EPS: f64 = 1e-10;

/// Slack on the cumulative comparison during CDF draws
const CDF_EPS: f64 = 1e-12;

// ============================================================================
// TYPES
// ============================================================================

/// Outcome of a top-M draw
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingResult {
    /// Chosen candidate indices, in selection order, each distinct
    pub selected_indices: Vec<usize>,
    /// Sampling probability of every candidate (length K, sums to 1)
    pub probabilities: Vec<f32>,
}

impl SamplingResult {
    fn empty(k: usize) -> Self {
        let p = if k == 0 { 0.0 } else { 1.0 / k as f32 };
        Self {
            selected_indices: Vec::new(),
            probabilities: vec![p; k],
        }
    }
}

// ============================================================================
// SAMPLER
// ============================================================================

/// Sample `top_m` distinct candidate indices from `scores` via Gumbel-Softmax
///
/// Edge cases: `top_m == 0` yields an empty selection (uniform probabilities
/// are still reported); `top_m >= K` selects everything with probability
/// `1/K` each. A degenerate softmax (underflow or non-finite denominator)
/// falls back to uniform probabilities and deterministic first-M selection.
pub fn sample_top_m<R: Rng + ?Sized>(
    scores: &[f32],
    top_m: usize,
    temperature: f32,
    rng: &mut R,
) -> SamplingResult {
    let k = scores.len();
    if k == 0 || top_m == 0 {
        return SamplingResult::empty(k);
    }
    if top_m >= k {
        return SamplingResult {
            selected_indices: (0..k).collect(),
            probabilities: vec![1.0 / k as f32; k],
        };
    }

    // Logits in f64; the double log amplifies rounding
    let tau = f64::from(temperature);
    let logits: Vec<f64> = scores
        .iter()
        .map(|&s| {
            let u: f64 = rng.gen_range(UNIFORM_EPS..1.0 - UNIFORM_EPS);
            let gumbel = -(-u.ln()).ln();
            f64::from(s) / tau + gumbel
        })
        .collect();

    match softmax(&logits) {
        Some(probabilities) => {
            let selected_indices = draw_without_replacement(&probabilities, top_m, rng);
            SamplingResult {
                selected_indices,
                probabilities: probabilities.iter().map(|&p| p as f32).collect(),
            }
        }
        None => {
            // Degenerate softmax: uniform probabilities, deterministic first-M
            tracing::warn!(candidates = k, "softmax underflow, falling back to uniform selection");
            SamplingResult {
                selected_indices: (0..top_m).collect(),
                probabilities: vec![1.0 / k as f32; k],
            }
        }
    }
}

/// Max-shifted softmax; `None` when the denominator underflows or any logit
/// is non-finite (e.g. a zero or negative temperature upstream)
fn softmax(values: &[f64]) -> Option<Vec<f64>> {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return None;
    }
    let exps: Vec<f64> = values.iter().map(|v| (v - max).exp()).collect();
    let denom: f64 = exps.iter().sum();
    if !denom.is_finite() || denom <= 0.0 {
        return None;
    }
    Some(exps.into_iter().map(|e| e / denom).collect())
}

/// CDF sampling of `count` distinct indices, renormalizing after each draw
fn draw_without_replacement<R: Rng + ?Sized>(
    probabilities: &[f64],
    count: usize,
    rng: &mut R,
) -> Vec<usize> {
    let mut remaining: Vec<f64> = probabilities.to_vec();
    let mut selected = Vec::with_capacity(count);

    for _ in 0..count {
        let mass: f64 = remaining.iter().sum();
        if mass <= 0.0 {
            // All remaining mass consumed by rounding; take the first
            // unselected indices in order.
            for (i, &p) in remaining.iter().enumerate() {
                if p >= 0.0 && !selected.contains(&i) && selected.len() < count {
                    selected.push(i);
                }
            }
            break;
        }

        let target: f64 = rng.gen_range(0.0..1.0) * mass;
        let mut cumulative = 0.0;
        let mut chosen = None;
        for (i, &p) in remaining.iter().enumerate() {
            if p < 0.0 {
                continue;
            }
            cumulative += p;
            if cumulative + CDF_EPS >= target {
                chosen = Some(i);
                break;
            }
        }
        // Rounding can leave the cursor past every bucket; fall back to the
        // last index still carrying mass.
        let chosen = chosen.unwrap_or_else(|| {
            remaining
                .iter()
                .enumerate()
                .rev()
                .find(|&(_, &p)| p >= 0.0)
                .map(|(i, _)| i)
                .unwrap_or(0)
        });

        selected.push(chosen);
        // Negative sentinel removes the index from future draws
        remaining[chosen] = -1.0;
    }

    selected
}

// ============================================================================
// TESTS
// ============================================================================
