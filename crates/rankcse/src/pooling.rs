//! Parameter-free poolers that reduce per-token hidden states to one
//! sentence vector.
//!
//! | Pooler | Source |
//! |--------|--------|
//! | `cls`, `cls_before_pooler` | position 0 of the last layer |
//! | `avg` | masked mean of the last layer |
//! | `avg_top2` | masked mean of the mean of the last two layers |
//! | `avg_first_last` | masked mean of the mean of the first and last layers |
//!
//! Masked means divide by the number of unmasked tokens. A sequence whose
//! mask is all zeros is a caller contract violation and yields non-finite
//! values; it is not checked here.

use candle_core::{IndexOp, Tensor};

use crate::backbone::BackboneOutput;
use crate::config::PoolerType;
use crate::error::{RankCseError, RankCseResult};

/// Pools backbone outputs according to a fixed [`PoolerType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pooler {
    pooler_type: PoolerType,
}

impl Pooler {
    /// Create a pooler. The type is already validated by construction of
    /// the enum, so this cannot fail.
    pub fn new(pooler_type: PoolerType) -> Self {
        Self { pooler_type }
    }

    /// Build a pooler from its configuration name.
    ///
    /// # Errors
    /// - `RankCseError::UnsupportedConfig` for unknown names
    pub fn from_name(name: &str) -> RankCseResult<Self> {
        Ok(Self::new(name.parse()?))
    }

    /// Configured pooling strategy.
    pub fn pooler_type(&self) -> PoolerType {
        self.pooler_type
    }

    /// Reduce `outputs` to `(rows, hidden)`.
    ///
    /// # Arguments
    /// * `attention_mask` - `(rows, seq_len)`, any numeric dtype
    /// * `outputs` - backbone output for the same rows
    ///
    /// # Errors
    /// - `RankCseError::InvalidInput` if a multi-layer pooler is used and the
    ///   backbone did not return enough hidden states
    pub fn pool(&self, attention_mask: &Tensor, outputs: &BackboneOutput) -> RankCseResult<Tensor> {
        let last_hidden = &outputs.last_hidden_state;
        match self.pooler_type {
            PoolerType::Cls | PoolerType::ClsBeforePooler => last_hidden
                .i((.., 0))
                .map_err(|e| map_candle("cls token select", e)),
            PoolerType::Avg => masked_mean(last_hidden, attention_mask),
            PoolerType::AvgFirstLast => {
                let layers = self.layers(outputs, 1)?;
                let first = &layers[0];
                let last = &layers[layers.len() - 1];
                masked_mean(&layer_average(first, last)?, attention_mask)
            }
            PoolerType::AvgTop2 => {
                let layers = self.layers(outputs, 2)?;
                let second_last = &layers[layers.len() - 2];
                let last = &layers[layers.len() - 1];
                masked_mean(&layer_average(last, second_last)?, attention_mask)
            }
        }
    }

    fn layers<'a>(&self, outputs: &'a BackboneOutput, min: usize) -> RankCseResult<&'a [Tensor]> {
        match outputs.hidden_states.as_deref() {
            Some(layers) if layers.len() >= min => Ok(layers),
            Some(layers) => Err(RankCseError::invalid_input(format!(
                "pooler '{}' needs at least {} hidden states, backbone returned {}",
                self.pooler_type,
                min,
                layers.len()
            ))),
            None => Err(RankCseError::invalid_input(format!(
                "pooler '{}' needs per-layer hidden states but the backbone returned none",
                self.pooler_type
            ))),
        }
    }
}

fn layer_average(a: &Tensor, b: &Tensor) -> RankCseResult<Tensor> {
    (a + b)
        .and_then(|s| s.affine(0.5, 0.0))
        .map_err(|e| map_candle("layer average", e))
}

/// `sum(hidden · mask) / sum(mask)` over the sequence axis.
fn masked_mean(hidden: &Tensor, attention_mask: &Tensor) -> RankCseResult<Tensor> {
    let mask = attention_mask
        .to_dtype(hidden.dtype())
        .map_err(|e| map_candle("mask cast", e))?;

    let summed = hidden
        .broadcast_mul(&mask.unsqueeze(2).map_err(|e| map_candle("mask expand", e))?)
        .and_then(|m| m.sum(1))
        .map_err(|e| map_candle("masked sum", e))?;

    let counts = mask
        .sum_keepdim(1)
        .map_err(|e| map_candle("mask count", e))?;

    summed
        .broadcast_div(&counts)
        .map_err(|e| map_candle("mean pooling div", e))
}

fn map_candle(op: &str, e: candle_core::Error) -> RankCseError {
    RankCseError::tensor(&format!("Pooling {} failed", op), e)
}
