//! Dense Matrix Kernel
//!
//! The small linear-algebra core behind the reranker: residual embedding
//! transforms (`v + W·v`), REINFORCE outer products, and gradient clipping.
//!
//! Everything here is plain row-major `f32` with shape-checked operations.
//! The turn hot path only ever needs matrix-vector multiplies; the full
//! matrix-matrix multiply exists for completeness and tooling, not for the
//! per-turn budget.
//!
//! Numeric policy: accumulation happens in `f32` (the element width), and
//! tests compare matrices only up to a small epsilon.

use rand::Rng;
use serde::{Deserialize, Serialize};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Matrix kernel error type
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinalgError {
    /// Operand shapes disagree
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Expected dimension (rows, cols, or vector length)
        expected: usize,
        /// Dimension actually supplied
        got: usize,
    },
}

/// Matrix kernel result type
pub type Result<T> = std::result::Result<T, LinalgError>;

// ============================================================================
// MATRIX
// ============================================================================

/// A dense row-major matrix of `f32`
///
/// Serializes with its shape so persisted weights and accumulators are
/// self-describing documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Matrix {
    /// Create a matrix from row-major data
    pub fn from_data(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(LinalgError::DimensionMismatch {
                expected: rows * cols,
                got: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// Create an all-zeros matrix
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Create an identity matrix
    pub fn identity(n: usize) -> Self {
        let mut m = Self::zeros(n, n);
        for i in 0..n {
            m.data[i * n + i] = 1.0;
        }
        m
    }

    /// Create a matrix with entries drawn from `N(mean, std^2)`
    ///
    /// Uses the Box-Muller transform over uniform draws. The first uniform
    /// draw is floored above zero so `ln(u)` can never hit `ln(0)`.
    pub fn gaussian<R: Rng + ?Sized>(
        rows: usize,
        cols: usize,
        mean: f32,
        std: f32,
        rng: &mut R,
    ) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        while data.len() < rows * cols {
            let u1: f32 = rng.gen_range(0.0..1.0_f32).max(f32::MIN_POSITIVE);
            let u2: f32 = rng.gen_range(0.0..1.0_f32);
            let radius = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f32::consts::PI * u2;
            data.push(mean + std * radius * theta.cos());
            if data.len() < rows * cols {
                data.push(mean + std * radius * theta.sin());
            }
        }
        Self { rows, cols, data }
    }

    /// Number of rows
    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns
    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Row-major backing slice
    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Element accessor (row, col)
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }

    /// Whether every entry is finite
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|x| x.is_finite())
    }

    /// Classical O(rows * cols) matrix-vector multiply
    pub fn matvec(&self, v: &[f32]) -> Result<Vec<f32>> {
        if v.len() != self.cols {
            return Err(LinalgError::DimensionMismatch {
                expected: self.cols,
                got: v.len(),
            });
        }
        let mut out = Vec::with_capacity(self.rows);
        for row in self.data.chunks_exact(self.cols) {
            let mut acc = 0.0_f32;
            for (w, x) in row.iter().zip(v.iter()) {
                acc += w * x;
            }
            out.push(acc);
        }
        Ok(out)
    }

    /// Matrix-matrix multiply
    ///
    /// Not on the turn hot path; used by tooling and tests only.
    pub fn matmul(&self, other: &Matrix) -> Result<Matrix> {
        if self.cols != other.rows {
            return Err(LinalgError::DimensionMismatch {
                expected: self.cols,
                got: other.rows,
            });
        }
        let mut out = Matrix::zeros(self.rows, other.cols);
        for i in 0..self.rows {
            for k in 0..self.cols {
                let lhs = self.data[i * self.cols + k];
                if lhs == 0.0 {
                    continue;
                }
                for j in 0..other.cols {
                    out.data[i * other.cols + j] += lhs * other.data[k * other.cols + j];
                }
            }
        }
        Ok(out)
    }

    /// Element-wise sum
    pub fn add(&self, other: &Matrix) -> Result<Matrix> {
        self.check_same_shape(other)?;
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a + b)
            .collect();
        Ok(Matrix {
            rows: self.rows,
            cols: self.cols,
            data,
        })
    }

    /// Element-wise difference
    pub fn sub(&self, other: &Matrix) -> Result<Matrix> {
        self.check_same_shape(other)?;
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a - b)
            .collect();
        Ok(Matrix {
            rows: self.rows,
            cols: self.cols,
            data,
        })
    }

    /// In-place element-wise accumulation
    pub fn add_assign(&mut self, other: &Matrix) -> Result<()> {
        self.check_same_shape(other)?;
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += b;
        }
        Ok(())
    }

    /// Scalar multiply
    pub fn scale(&self, factor: f32) -> Matrix {
        Matrix {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(|x| x * factor).collect(),
        }
    }

    /// In-place scalar multiply
    pub fn scale_assign(&mut self, factor: f32) {
        for x in &mut self.data {
            *x *= factor;
        }
    }

    /// Outer product `a ⊗ b` (|a| x |b|)
    pub fn outer(a: &[f32], b: &[f32]) -> Matrix {
        let mut data = Vec::with_capacity(a.len() * b.len());
        for &x in a {
            for &y in b {
                data.push(x * y);
            }
        }
        Matrix {
            rows: a.len(),
            cols: b.len(),
            data,
        }
    }

    /// Clamp every entry into `[lo, hi]`
    pub fn clip_elementwise(&mut self, lo: f32, hi: f32) {
        for x in &mut self.data {
            *x = x.clamp(lo, hi);
        }
    }

    /// Frobenius (L2) norm
    pub fn l2_norm(&self) -> f32 {
        self.data.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Clip by L2 norm: when the norm exceeds `max_norm` the matrix is
    /// scaled in place by `max_norm / norm`; otherwise it is left untouched.
    ///
    /// Returns whether scaling was applied.
    pub fn clip_l2(&mut self, max_norm: f32) -> bool {
        let norm = self.l2_norm();
        if !norm.is_finite() || norm <= max_norm {
            return false;
        }
        self.scale_assign(max_norm / norm);
        true
    }

    /// Element-accurate equality up to `eps`
    pub fn approx_eq(&self, other: &Matrix, eps: f32) -> bool {
        self.rows == other.rows
            && self.cols == other.cols
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| (a - b).abs() <= eps)
    }

    fn check_same_shape(&self, other: &Matrix) -> Result<()> {
        if self.rows != other.rows {
            return Err(LinalgError::DimensionMismatch {
                expected: self.rows,
                got: other.rows,
            });
        }
        if self.cols != other.cols {
            return Err(LinalgError::DimensionMismatch {
                expected: self.cols,
                got: other.cols,
            });
        }
        Ok(())
    }
}

// ============================================================================
// VECTOR HELPERS
// ============================================================================

/// Residual sum `v + Wv`
///
/// The embedding adaptation step: with `W = 0` this is the identity, with
/// `W = I` it doubles the input.
pub fn residual_add(v: &[f32], wv: &[f32]) -> Result<Vec<f32>> {
    if v.len() != wv.len() {
        return Err(LinalgError::DimensionMismatch {
            expected: v.len(),
            got: wv.len(),
        });
    }
    Ok(v.iter().zip(wv.iter()).map(|(a, b)| a + b).collect())
}

/// Element-wise vector difference
pub fn vec_sub(a: &[f32], b: &[f32]) -> Result<Vec<f32>> {
    if a.len() != b.len() {
        return Err(LinalgError::DimensionMismatch {
            expected: a.len(),
            got: b.len(),
        });
    }
    Ok(a.iter().zip(b.iter()).map(|(x, y)| x - y).collect())
}

/// Dot product with an overflow guard
///
/// A non-finite accumulation is clamped to a large finite value with the
/// sign preserved, so downstream softmax never sees NaN or infinity.
#[inline]
pub fn dot_clamped(a: &[f32], b: &[f32]) -> f32 {
    let mut acc = 0.0_f32;
    for (x, y) in a.iter().zip(b.iter()) {
        acc += x * y;
    }
    if acc.is_finite() {
        acc
    } else if acc.is_sign_negative() {
        f32::MIN / 2.0
    } else {
        f32::MAX / 2.0
    }
}

// ============================================================================
// TESTS
// ============================================================================
