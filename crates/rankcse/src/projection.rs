//! MLP projection head applied over the `cls` representation.
//!
//! `tanh(W·x + b)` with `W: [hidden, hidden]`. Weights come from a
//! `VarBuilder`, so when it is backed by a `VarMap` they are trainable `Var`s
//! that an optimizer can step.

use candle_core::Tensor;
use candle_nn::{linear, Linear, Module, VarBuilder};

use crate::error::{RankCseError, RankCseResult};

/// Dense layer followed by `tanh`.
#[derive(Debug, Clone)]
pub struct MlpLayer {
    dense: Linear,
    hidden_size: usize,
}

impl MlpLayer {
    /// Build the head under `vb` (parameters `dense.weight`, `dense.bias`).
    pub fn new(hidden_size: usize, vb: VarBuilder) -> RankCseResult<Self> {
        let dense = linear(hidden_size, hidden_size, vb.pp("dense"))
            .map_err(|e| RankCseError::tensor("MlpLayer dense init failed", e))?;
        Ok(Self { dense, hidden_size })
    }

    /// Input/output width.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Project `(..., hidden)` features.
    pub fn forward(&self, features: &Tensor) -> RankCseResult<Tensor> {
        self.dense
            .forward(features)
            .and_then(|x| x.tanh())
            .map_err(|e| RankCseError::tensor("MlpLayer forward failed", e))
    }
}
