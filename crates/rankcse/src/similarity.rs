//! Temperature-scaled cosine similarity.
//!
//! `sim[i, j] = cos(a_i, b_j) / τ`. Row norms are clamped below at `1e-8`
//! so a zero vector yields similarity 0 instead of NaN.

use candle_core::Tensor;

use crate::error::{RankCseError, RankCseResult};

const NORM_EPS: f64 = 1e-8;

/// Cosine similarity divided by a fixed positive temperature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    temperature: f64,
}

impl Similarity {
    /// # Errors
    /// - `RankCseError::ConfigError` if `temperature` is not positive
    pub fn new(temperature: f32) -> RankCseResult<Self> {
        if !temperature.is_finite() || temperature <= 0.0 {
            return Err(RankCseError::ConfigError {
                message: format!("temperature must be positive, got {}", temperature),
            });
        }
        Ok(Self {
            temperature: temperature as f64,
        })
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    /// Pairwise similarity between `a: (M, H)` and `b: (N, H)` → `(M, N)`.
    ///
    /// Equivalent to broadcasting `(M, 1, H)` against `(1, N, H)` and reducing
    /// over the last axis, without materialising the `(M, N, H)` product.
    pub fn matrix(&self, a: &Tensor, b: &Tensor) -> RankCseResult<Tensor> {
        let (_, ha) = a.dims2().map_err(|e| map_candle("lhs shape", e))?;
        let (_, hb) = b.dims2().map_err(|e| map_candle("rhs shape", e))?;
        if ha != hb {
            return Err(RankCseError::DimensionMismatch {
                expected: ha,
                got: hb,
            });
        }

        let an = l2_normalize_rows(a)?;
        let bn = l2_normalize_rows(b)?;
        an.matmul(&bn.t().map_err(|e| map_candle("transpose", e))?)
            .and_then(|m| m.affine(1.0 / self.temperature, 0.0))
            .map_err(|e| map_candle("cosine matmul", e))
    }
}

fn l2_normalize_rows(x: &Tensor) -> RankCseResult<Tensor> {
    let norms = x
        .sqr()
        .and_then(|s| s.sum_keepdim(1))
        .and_then(|s| s.sqrt())
        .and_then(|n| n.maximum(NORM_EPS))
        .map_err(|e| map_candle("row norm", e))?;
    x.broadcast_div(&norms)
        .map_err(|e| map_candle("row normalize", e))
}

fn map_candle(op: &str, e: candle_core::Error) -> RankCseError {
    RankCseError::tensor(&format!("Similarity {} failed", op), e)
}
