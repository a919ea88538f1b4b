//! Token-level cross-entropy for the masked-language-model auxiliary term.
//!
//! Only positions whose label differs from [`IGNORE_INDEX`] contribute; the
//! loss is the mean negative log-likelihood over those positions.

use candle_core::{DType, Tensor};

use crate::error::{RankCseError, RankCseResult};

/// Label value marking positions that are not predicted.
pub const IGNORE_INDEX: i64 = -100;

/// Mean cross-entropy over non-ignored positions.
///
/// # Arguments
/// * `prediction_scores` - `(..., vocab)` logits
/// * `labels` - integer labels with the same leading shape, `-100` to skip
///
/// # Errors
/// - `RankCseError::DimensionMismatch` if the number of label positions
///   differs from the number of logit rows
/// - `RankCseError::InvalidInput` if a label lies outside `0..vocab`
pub fn masked_lm_loss(prediction_scores: &Tensor, labels: &Tensor) -> RankCseResult<Tensor> {
    let vocab = prediction_scores
        .dims()
        .last()
        .copied()
        .ok_or_else(|| RankCseError::invalid_input("prediction scores must have a vocab axis"))?;
    let scores = prediction_scores
        .reshape(((), vocab))
        .map_err(|e| map_candle("flatten scores", e))?;
    let positions = scores.dim(0).map_err(|e| map_candle("positions", e))?;

    let labels: Vec<i64> = labels
        .flatten_all()
        .and_then(|l| l.to_dtype(DType::I64))
        .and_then(|l| l.to_vec1::<i64>())
        .map_err(|e| map_candle("read labels", e))?;
    if labels.len() != positions {
        return Err(RankCseError::DimensionMismatch {
            expected: positions,
            got: labels.len(),
        });
    }

    let mut targets = Vec::with_capacity(positions);
    let mut mask = Vec::with_capacity(positions);
    for &label in &labels {
        if label == IGNORE_INDEX {
            targets.push(0u32);
            mask.push(0.0f32);
        } else if (0..vocab as i64).contains(&label) {
            targets.push(label as u32);
            mask.push(1.0f32);
        } else {
            return Err(RankCseError::invalid_input(format!(
                "mlm label {} outside vocabulary of size {}",
                label, vocab
            )));
        }
    }

    let counted = mask.iter().filter(|&&m| m > 0.0).count();
    let device = scores.device();
    if counted == 0 {
        tracing::warn!("MLM batch has no labelled positions; mlm loss is 0");
        return Tensor::zeros((), scores.dtype(), device).map_err(|e| map_candle("zero loss", e));
    }

    let targets = Tensor::from_vec(targets, (positions, 1), device)
        .map_err(|e| map_candle("targets", e))?;
    let mask = Tensor::from_vec(mask, positions, device)
        .and_then(|m| m.to_dtype(scores.dtype()))
        .map_err(|e| map_candle("mask", e))?;

    candle_nn::ops::log_softmax(&scores, 1)
        .and_then(|lp| lp.gather(&targets, 1))
        .and_then(|picked| picked.squeeze(1))
        .and_then(|picked| picked.mul(&mask))
        .and_then(|picked| picked.sum_all())
        .and_then(|total| total.affine(-1.0 / counted as f64, 0.0))
        .map_err(|e| map_candle("nll", e))
}

fn map_candle(op: &str, e: candle_core::Error) -> RankCseError {
    RankCseError::tensor(&format!("MLM loss {} failed", op), e)
}
