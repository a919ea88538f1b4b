//! Spearman-style rank correlation between rows of distance matrices.
//!
//! Each row of `x: (n, d)` is replaced by the rank position of every value
//! (`0..d`), centred by its mean, and L2-normalised. The correlation matrix
//! is `xn · ynᵀ`, so every entry lies in `[-1, 1]`.
//!
//! Ranks come from a stable ascending sort: tied values keep their column
//! order and receive distinct ranks. This is not average-rank Spearman.
//!
//! The target is a fixed auxiliary signal. It is computed on the host from
//! detached values and never carries gradient. Values are ranked in `f64`,
//! so distinct `f64` distances never collapse into ties; only the final
//! normalised ranks are stored as `f32`.

use candle_core::{DType, Tensor};

use crate::error::{RankCseError, RankCseResult};

/// Rank positions of every value within its row.
///
/// `ranks[i][j]` is the position of `x[i][j]` in the stable ascending order of
/// row `i`, using the IEEE total order: a positive NaN sorts after every
/// number and a negative NaN before every number.
pub fn row_ranks(rows: &[Vec<f64>]) -> Vec<Vec<f32>> {
    rows.iter()
        .map(|row| {
            let mut order: Vec<usize> = (0..row.len()).collect();
            order.sort_by(|&a, &b| row[a].total_cmp(&row[b]));
            let mut ranks = vec![0.0f32; row.len()];
            for (position, &column) in order.iter().enumerate() {
                ranks[column] = position as f32;
            }
            ranks
        })
        .collect()
}

/// Rank tensor `(n, d)` for `x`, as `f32` on `x`'s device.
pub fn ranks(x: &Tensor) -> RankCseResult<Tensor> {
    let (n, d) = x.dims2().map_err(|e| map_candle("input shape", e))?;
    let rows = host_rows(x)?;
    let flat: Vec<f32> = row_ranks(&rows).into_iter().flatten().collect();
    Tensor::from_vec(flat, (n, d), x.device()).map_err(|e| map_candle("rank tensor", e))
}

/// Spearman-style correlation between every row of `x` and every row of `y`.
///
/// # Arguments
/// * `x` - `(n_x, d)` real values
/// * `y` - `(n_y, d)` real values (pass `x` again for a self-correlation)
///
/// # Returns
/// `(n_x, n_y)` `f32` matrix on `x`'s device, detached from any graph.
///
/// # Errors
/// - `RankCseError::InvalidInput` if an input is not rank 2 or `d < 2`
/// - `RankCseError::DimensionMismatch` if `x` and `y` disagree on `d`
pub fn spearman_correlation(x: &Tensor, y: &Tensor) -> RankCseResult<Tensor> {
    let (n_x, d_x) = check_shape(x)?;
    let (n_y, d_y) = check_shape(y)?;
    if d_x != d_y {
        return Err(RankCseError::DimensionMismatch {
            expected: d_x,
            got: d_y,
        });
    }

    let xn = normalized_ranks(&host_rows(x)?);
    let yn = normalized_ranks(&host_rows(y)?);

    let device = x.device();
    let xt = Tensor::from_vec(xn, (n_x, d_x), device).map_err(|e| map_candle("lhs tensor", e))?;
    let yt = Tensor::from_vec(yn, (n_y, d_y), device).map_err(|e| map_candle("rhs tensor", e))?;

    // Clamp absorbs f32 rounding so self-correlations never exceed 1.
    xt.matmul(&yt.t().map_err(|e| map_candle("transpose", e))?)
        .and_then(|m| m.clamp(-1.0f32, 1.0f32))
        .map_err(|e| map_candle("correlation matmul", e))
}

fn check_shape(x: &Tensor) -> RankCseResult<(usize, usize)> {
    let (n, d) = x.dims2().map_err(|_| {
        RankCseError::invalid_input(format!(
            "rank correlation expects a (n, d) matrix, got shape {:?}",
            x.dims()
        ))
    })?;
    // Stable ranks of d >= 2 values are a permutation of 0..d, which always
    // has non-zero variance. d == 1 would divide by zero.
    if d < 2 {
        return Err(RankCseError::invalid_input(format!(
            "rank correlation needs at least 2 values per row, got {}",
            d
        )));
    }
    Ok((n, d))
}

fn host_rows(x: &Tensor) -> RankCseResult<Vec<Vec<f64>>> {
    x.detach()
        .to_dtype(DType::F64)
        .and_then(|t| t.to_vec2::<f64>())
        .map_err(|e| map_candle("host copy", e))
}

/// Centre and L2-normalise rank rows, flattened row-major.
fn normalized_ranks(rows: &[Vec<f64>]) -> Vec<f32> {
    row_ranks(rows)
        .into_iter()
        .flat_map(|ranks| {
            let d = ranks.len() as f64;
            let mean = ranks.iter().map(|&r| r as f64).sum::<f64>() / d;
            let centred: Vec<f64> = ranks.iter().map(|&r| r as f64 - mean).collect();
            let norm = centred.iter().map(|c| c * c).sum::<f64>().sqrt();
            centred.into_iter().map(move |c| (c / norm) as f32)
        })
        .collect()
}

fn map_candle(op: &str, e: candle_core::Error) -> RankCseError {
    RankCseError::tensor(&format!("Rank correlation {} failed", op), e)
}
