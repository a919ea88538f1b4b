//! Contrastive loss with a rank-correlation auxiliary term.
//!
//! Components:
//! 1. In-batch InfoNCE over `sim(z1, z2)` (plus hard-negative columns
//!    `sim(z1, z3)` when a third view is present)
//! 2. Thresholded MSE between the temperature-rescaled similarity matrix and
//!    a Spearman rank-correlation target built from auxiliary distances
//!
//! The two are combined by `weighted_sum` (`L_c + λ·L_r`) or `hinge`
//! (`max(L_c, λ·L_r)`). An optional MLM term is added on top by the encoder
//! through [`ContrastiveLossOutput::with_mlm_term`].

use candle_core::{DType, Tensor};

use crate::config::{LossCombination, RankCseConfig, RankConfig};
use crate::error::{RankCseError, RankCseResult};
use crate::rank_corr::spearman_correlation;
use crate::similarity::Similarity;

/// Added to the mask count so an empty threshold window divides by a tiny
/// positive number and yields 0.
const MASK_EPS: f64 = 1e-8;

/// Per-component loss values for logging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossComponents {
    /// InfoNCE cross-entropy.
    pub contrastive: f32,
    /// Unweighted thresholded rank-correlation MSE (0 when disabled).
    pub rank: f32,
    /// Unweighted masked-language-model loss (0 when absent).
    pub mlm: f32,
    /// Total combined loss.
    pub total: f32,
    /// Number of target entries inside the threshold window.
    pub rank_entries: usize,
}

/// Result of one loss computation.
#[derive(Debug, Clone)]
pub struct ContrastiveLossOutput {
    /// Scalar total loss, attached to the computation graph.
    pub loss: Tensor,
    /// Logits fed to the cross-entropy: `(rows, cols)` with hard-negative
    /// columns appended when present.
    pub logits: Tensor,
    /// Rank-correlation target `(n, n)` when the rank term is enabled.
    pub rank_target: Option<Tensor>,
    /// Scalar values for logging.
    pub components: LossComponents,
}

impl ContrastiveLossOutput {
    /// Add `weight · mlm_loss` to the total.
    pub fn with_mlm_term(mut self, mlm_loss: &Tensor, weight: f32) -> RankCseResult<Self> {
        self.loss = mlm_loss
            .affine(weight as f64, 0.0)
            .and_then(|w| self.loss.add(&w))
            .map_err(|e| map_candle("mlm add", e))?;
        self.components.mlm = tensor_to_f32(mlm_loss)?;
        self.components.total = tensor_to_f32(&self.loss)?;
        Ok(self)
    }
}

/// Contrastive + rank-correlation loss for one forward call.
#[derive(Debug, Clone)]
pub struct ContrastiveLoss {
    similarity: Similarity,
    hard_negative_weight: f32,
    rank: RankConfig,
}

impl ContrastiveLoss {
    /// Create the loss from a validated configuration.
    ///
    /// # Errors
    /// - `RankCseError::ConfigError` if the configuration is invalid
    pub fn new(config: &RankCseConfig) -> RankCseResult<Self> {
        config.validate()?;
        Ok(Self {
            similarity: Similarity::new(config.contrastive.temperature)?,
            hard_negative_weight: config.contrastive.hard_negative_weight,
            rank: config.rank.clone(),
        })
    }

    /// Similarity scorer shared with the encoder.
    pub fn similarity(&self) -> &Similarity {
        &self.similarity
    }

    /// Build the contrastive logits.
    ///
    /// Returns `(base, logits)` where `base = sim(z1, z2)` and `logits` equals
    /// `base` or, with a hard negative, `[base | sim(z1, z3) + W]` where `W`
    /// holds `hard_negative_weight` on the diagonal of the appended block only.
    pub fn logits(
        &self,
        z1: &Tensor,
        z2: &Tensor,
        z3: Option<&Tensor>,
    ) -> RankCseResult<(Tensor, Tensor)> {
        let base = self.similarity.matrix(z1, z2)?;
        let Some(z3) = z3 else {
            return Ok((base.clone(), base));
        };

        let hard = self.similarity.matrix(z1, z3)?;
        let logits = Tensor::cat(&[&base, &hard], 1).map_err(|e| map_candle("hard negative concat", e))?;
        let weights = self.hard_negative_weights(
            logits.dim(0).map_err(|e| map_candle("rows", e))?,
            base.dim(1).map_err(|e| map_candle("base cols", e))?,
            hard.dim(1).map_err(|e| map_candle("hard cols", e))?,
            &logits,
        )?;
        let logits = logits
            .add(&weights)
            .map_err(|e| map_candle("hard negative weights", e))?;
        Ok((base, logits))
    }

    fn hard_negative_weights(
        &self,
        rows: usize,
        base_cols: usize,
        hard_cols: usize,
        like: &Tensor,
    ) -> RankCseResult<Tensor> {
        let cols = base_cols + hard_cols;
        let mut data = vec![0.0f32; rows * cols];
        for i in 0..rows.min(hard_cols) {
            data[i * cols + base_cols + i] = self.hard_negative_weight;
        }
        Tensor::from_vec(data, (rows, cols), like.device())
            .and_then(|w| w.to_dtype(like.dtype()))
            .map_err(|e| map_candle("weight matrix", e))
    }

    /// Cross-entropy of `logits` rows against the identity labels `0..rows`.
    pub fn contrastive_loss(&self, logits: &Tensor) -> RankCseResult<Tensor> {
        let rows = logits.dim(0).map_err(|e| map_candle("logit rows", e))?;
        let labels = Tensor::arange(0u32, rows as u32, logits.device())
            .map_err(|e| map_candle("labels", e))?;
        candle_nn::loss::cross_entropy(logits, &labels).map_err(|e| map_candle("cross entropy", e))
    }

    /// Thresholded MSE between `sim · τ` and `target`.
    ///
    /// Only entries with `thresh_low ≤ target ≤ thresh_upp` contribute; the
    /// sum is divided by their count plus `1e-8`.
    ///
    /// # Returns
    /// (scalar loss, number of selected entries)
    pub fn rank_loss(&self, sim: &Tensor, target: &Tensor) -> RankCseResult<(Tensor, usize)> {
        if sim.dims() != target.dims() {
            return Err(RankCseError::invalid_input(format!(
                "similarity block {:?} does not match rank target {:?}",
                sim.dims(),
                target.dims()
            )));
        }
        let target = target
            .to_dtype(sim.dtype())
            .map_err(|e| map_candle("target cast", e))?;

        let in_window = target
            .ge(self.rank.thresh_low as f64)
            .and_then(|low| target.le(self.rank.thresh_upp as f64).and_then(|upp| low.mul(&upp)))
            .and_then(|m| m.to_dtype(sim.dtype()))
            .map_err(|e| map_candle("threshold mask", e))?;

        let mse = sim
            .affine(self.similarity.temperature(), 0.0)
            .and_then(|s| s.sub(&target))
            .and_then(|d| d.sqr())
            .map_err(|e| map_candle("squared error", e))?;

        let count = in_window.sum_all().map_err(|e| map_candle("mask count", e))?;
        let loss = mse
            .mul(&in_window)
            .and_then(|m| m.sum_all())
            .and_then(|s| s.div(&(&count + MASK_EPS)?))
            .map_err(|e| map_candle("masked mean", e))?;

        let selected = tensor_to_f32(&count)?.round() as usize;
        Ok((loss, selected))
    }

    /// Full loss for one batch.
    ///
    /// # Arguments
    /// * `z1`, `z2` - positive-pair embeddings `(rows, hidden)`
    /// * `z3` - hard-negative embeddings `(rows, hidden)`, if present
    /// * `distances` - auxiliary distances `(n, d)` for the rank target
    /// * `local_offset` - row/column offset of this process's instances in
    ///   the (possibly gathered) similarity matrix
    ///
    /// # Errors
    /// - `RankCseError::UnsupportedConfig` if a hard negative is combined with
    ///   the rank term (raised after the hard-negative logits are built)
    /// - `RankCseError::InvalidInput` if the rank term is enabled and no
    ///   distances are supplied
    pub fn compute(
        &self,
        z1: &Tensor,
        z2: &Tensor,
        z3: Option<&Tensor>,
        distances: Option<&Tensor>,
        local_offset: usize,
    ) -> RankCseResult<ContrastiveLossOutput> {
        let (base, logits) = self.logits(z1, z2, z3)?;

        if z3.is_some() && self.rank.enabled {
            return Err(RankCseError::unsupported(
                "hard negatives cannot be combined with the rank-correlation loss",
            ));
        }

        let l_contrastive = self.contrastive_loss(&logits)?;
        let mut components = LossComponents {
            contrastive: tensor_to_f32(&l_contrastive)?,
            ..LossComponents::default()
        };

        if !self.rank.enabled {
            components.total = components.contrastive;
            return Ok(ContrastiveLossOutput {
                loss: l_contrastive,
                logits,
                rank_target: None,
                components,
            });
        }

        let distances = distances.ok_or_else(|| {
            RankCseError::invalid_input("rank-correlation loss is enabled but no distances were supplied")
        })?;
        let target = spearman_correlation(distances, distances)?;
        let target = target
            .to_device(base.device())
            .map_err(|e| map_candle("target to device", e))?;

        let block = local_block(&base, local_offset, target.dim(0).map_err(|e| map_candle("target rows", e))?)?;
        let (l_rank, selected) = self.rank_loss(&block, &target)?;
        if selected == 0 {
            tracing::warn!(
                "Rank threshold window [{}, {}] selected no entries; rank loss is 0",
                self.rank.thresh_low,
                self.rank.thresh_upp
            );
        }

        let weighted_rank = l_rank
            .affine(self.rank.lambda as f64, 0.0)
            .map_err(|e| map_candle("rank weight", e))?;
        let total = match self.rank.combination {
            LossCombination::WeightedSum => l_contrastive.add(&weighted_rank),
            LossCombination::Hinge => l_contrastive.maximum(&weighted_rank),
        }
        .map_err(|e| map_candle("combine", e))?;

        components.rank = tensor_to_f32(&l_rank)?;
        components.rank_entries = selected;
        components.total = tensor_to_f32(&total)?;

        Ok(ContrastiveLossOutput {
            loss: total,
            logits,
            rank_target: Some(target),
            components,
        })
    }
}

/// The `n × n` block of `base` starting at `(offset, offset)`.
fn local_block(base: &Tensor, offset: usize, n: usize) -> RankCseResult<Tensor> {
    let (rows, cols) = base.dims2().map_err(|e| map_candle("base shape", e))?;
    if rows == n && cols == n && offset == 0 {
        return Ok(base.clone());
    }
    if offset + n > rows || offset + n > cols {
        return Err(RankCseError::DimensionMismatch {
            expected: offset + n,
            got: rows.min(cols),
        });
    }
    base.narrow(0, offset, n)
        .and_then(|b| b.narrow(1, offset, n))
        .map_err(|e| map_candle("local block", e))
}

/// Extract a scalar f32 from a 0-dim or 1-element tensor.
pub(crate) fn tensor_to_f32(t: &Tensor) -> RankCseResult<f32> {
    let flat = t
        .to_dtype(DType::F32)
        .and_then(|t| t.flatten_all())
        .map_err(|e| map_candle("scalar flatten", e))?;
    let values = flat.to_vec1::<f32>().map_err(|e| map_candle("scalar read", e))?;
    values
        .first()
        .copied()
        .ok_or_else(|| RankCseError::invalid_input("expected a scalar tensor, got an empty one"))
}

fn map_candle(op: &str, e: candle_core::Error) -> RankCseError {
    RankCseError::tensor(&format!("Loss {} failed", op), e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    fn make_views(n: usize, d: usize) -> (Tensor, Tensor, Tensor) {
        let device = Device::Cpu;
        let z1: Vec<f32> = (0..n * d).map(|i| (i as f32 * 0.1).sin()).collect();
        let z2: Vec<f32> = (0..n * d).map(|i| (i as f32 * 0.1).sin() + 0.05 * (i as f32).cos()).collect();
        let z3: Vec<f32> = (0..n * d).map(|i| (i as f32 * 0.3 + 1.0).cos()).collect();
        (
            Tensor::from_vec(z1, (n, d), &device).unwrap(),
            Tensor::from_vec(z2, (n, d), &device).unwrap(),
            Tensor::from_vec(z3, (n, d), &device).unwrap(),
        )
    }

    fn distances(n: usize, d: usize) -> Tensor {
        let data: Vec<f32> = (0..n * d).map(|i| ((i * 7919) % 97) as f32 / 97.0).collect();
        Tensor::from_vec(data, (n, d), &Device::Cpu).unwrap()
    }

    fn scalar(t: &Tensor) -> f32 {
        tensor_to_f32(t).unwrap()
    }

    fn config_with(f: impl FnOnce(&mut RankCseConfig)) -> RankCseConfig {
        let mut config = RankCseConfig::default();
        f(&mut config);
        config
    }

    #[test]
    fn test_contrastive_loss_non_negative() {
        let loss_fn = ContrastiveLoss::new(&RankCseConfig::default()).unwrap();
        let (z1, z2, _) = make_views(4, 8);
        let (_, logits) = loss_fn.logits(&z1, &z2, None).unwrap();
        let l = scalar(&loss_fn.contrastive_loss(&logits).unwrap());
        assert!(l >= 0.0, "cross entropy must be >= 0, got {}", l);
    }

    #[test]
    fn test_contrastive_loss_near_zero_with_dominant_diagonal() {
        let loss_fn = ContrastiveLoss::new(&RankCseConfig::default()).unwrap();
        let logits = Tensor::from_vec(
            vec![50.0f32, -50.0, -50.0, 50.0],
            (2, 2),
            &Device::Cpu,
        )
        .unwrap();
        let l = scalar(&loss_fn.contrastive_loss(&logits).unwrap());
        assert!(l >= 0.0 && l < 1e-6, "got {}", l);
    }

    #[test]
    fn test_hard_negative_weight_only_on_block_diagonal() {
        let config = config_with(|c| {
            c.rank.enabled = false;
            c.contrastive.hard_negative_weight = 3.0;
        });
        let loss_fn = ContrastiveLoss::new(&config).unwrap();
        let (z1, z2, z3) = make_views(3, 4);
        let (base, logits) = loss_fn.logits(&z1, &z2, Some(&z3)).unwrap();
        assert_eq!(logits.dims(), &[3, 6]);

        let raw_hard: Vec<Vec<f32>> = loss_fn.similarity().matrix(&z1, &z3).unwrap().to_vec2().unwrap();
        let base: Vec<Vec<f32>> = base.to_vec2().unwrap();
        let logits: Vec<Vec<f32>> = logits.to_vec2().unwrap();
        for i in 0..3 {
            for j in 0..3 {
                assert_eq!(logits[i][j], base[i][j]);
                let expected = raw_hard[i][j] + if i == j { 3.0 } else { 0.0 };
                assert!((logits[i][3 + j] - expected).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_hard_negative_without_rank_term() {
        let config = config_with(|c| c.rank.enabled = false);
        let loss_fn = ContrastiveLoss::new(&config).unwrap();
        let (z1, z2, z3) = make_views(4, 8);
        let out = loss_fn.compute(&z1, &z2, Some(&z3), None, 0).unwrap();
        assert_eq!(out.logits.dims(), &[4, 8]);
        assert!(out.rank_target.is_none());
        assert_eq!(out.components.total, out.components.contrastive);
    }

    #[test]
    fn test_hard_negative_with_rank_term_is_unsupported() {
        let loss_fn = ContrastiveLoss::new(&RankCseConfig::default()).unwrap();
        let (z1, z2, z3) = make_views(4, 8);
        let err = loss_fn
            .compute(&z1, &z2, Some(&z3), Some(&distances(4, 5)), 0)
            .unwrap_err();
        assert!(matches!(err, RankCseError::UnsupportedConfig { .. }));
    }

    #[test]
    fn test_missing_distances_rejected() {
        let loss_fn = ContrastiveLoss::new(&RankCseConfig::default()).unwrap();
        let (z1, z2, _) = make_views(4, 8);
        let err = loss_fn.compute(&z1, &z2, None, None, 0).unwrap_err();
        assert!(matches!(err, RankCseError::InvalidInput { .. }));
    }

    #[test]
    fn test_weighted_sum_combination() {
        let loss_fn = ContrastiveLoss::new(&RankCseConfig::default()).unwrap();
        let (z1, z2, _) = make_views(4, 8);
        let out = loss_fn.compute(&z1, &z2, None, Some(&distances(4, 5)), 0).unwrap();
        let c = out.components;
        assert_eq!(c.rank_entries, 16);
        assert!(c.rank > 0.0);
        assert!((c.total - (c.contrastive + 0.05 * c.rank)).abs() < 1e-4);
    }

    #[test]
    fn test_hinge_combination_takes_max() {
        let config = config_with(|c| {
            c.rank.combination = LossCombination::Hinge;
            c.rank.lambda = 1000.0;
        });
        let loss_fn = ContrastiveLoss::new(&config).unwrap();
        let (z1, z2, _) = make_views(4, 8);
        let out = loss_fn.compute(&z1, &z2, None, Some(&distances(4, 5)), 0).unwrap();
        let c = out.components;
        let expected = c.contrastive.max(1000.0 * c.rank);
        assert!((c.total - expected).abs() < 1e-2 * expected.abs().max(1.0));
    }

    #[test]
    fn test_unsatisfiable_window_leaves_contrastive_only() {
        let config = config_with(|c| {
            c.rank.thresh_low = 2.0;
            c.rank.thresh_upp = 3.0;
        });
        let loss_fn = ContrastiveLoss::new(&config).unwrap();
        let (z1, z2, _) = make_views(4, 8);
        let out = loss_fn.compute(&z1, &z2, None, Some(&distances(4, 5)), 0).unwrap();
        assert_eq!(out.components.rank_entries, 0);
        assert!(out.components.rank.abs() < 1e-6);
        assert!((out.components.total - out.components.contrastive).abs() < 1e-6);
    }

    #[test]
    fn test_rank_loss_counts_only_window_entries() {
        let config = config_with(|c| {
            c.rank.thresh_low = 0.5;
            c.rank.thresh_upp = 1.0;
        });
        let loss_fn = ContrastiveLoss::new(&config).unwrap();
        let target = Tensor::from_vec(vec![1.0f32, 0.2, 0.2, 1.0], (2, 2), &Device::Cpu).unwrap();
        // sim · τ = [[1, 0], [0, 0]] -> only the diagonal counts: errors 0 and 1
        let sim = Tensor::from_vec(vec![20.0f32, 0.0, 0.0, 0.0], (2, 2), &Device::Cpu).unwrap();
        let (loss, selected) = loss_fn.rank_loss(&sim, &target).unwrap();
        assert_eq!(selected, 2);
        assert!((scalar(&loss) - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_local_block_for_gathered_batch() {
        let base = Tensor::arange(0f32, 16.0, &Device::Cpu)
            .unwrap()
            .reshape((4, 4))
            .unwrap();
        let block: Vec<Vec<f32>> = local_block(&base, 2, 2).unwrap().to_vec2().unwrap();
        assert_eq!(block, vec![vec![10.0, 11.0], vec![14.0, 15.0]]);
        assert!(local_block(&base, 3, 2).is_err());
    }

    #[test]
    fn test_gradient_reaches_both_views() {
        let (z1, z2, _) = make_views(4, 8);
        let v1 = Var::from_tensor(&z1).unwrap();
        let v2 = Var::from_tensor(&z2).unwrap();
        let loss_fn = ContrastiveLoss::new(&RankCseConfig::default()).unwrap();
        let out = loss_fn
            .compute(v1.as_tensor(), v2.as_tensor(), None, Some(&distances(4, 5)), 0)
            .unwrap();
        let grads = out.loss.backward().unwrap();
        for v in [&v1, &v2] {
            let g = grads.get(v.as_tensor()).expect("gradient must exist");
            let norm: f32 = g.sqr().unwrap().sum_all().unwrap().to_scalar().unwrap();
            assert!(norm > 1e-10);
        }
    }

    #[test]
    fn test_with_mlm_term_adds_weighted_loss() {
        let loss_fn = ContrastiveLoss::new(&RankCseConfig::default()).unwrap();
        let (z1, z2, _) = make_views(4, 8);
        let out = loss_fn.compute(&z1, &z2, None, Some(&distances(4, 5)), 0).unwrap();
        let before = out.components.total;
        let mlm = Tensor::new(2.0f32, &Device::Cpu).unwrap();
        let out = out.with_mlm_term(&mlm, 0.1).unwrap();
        assert_eq!(out.components.mlm, 2.0);
        assert!((out.components.total - (before + 0.2)).abs() < 1e-5);
    }
}
