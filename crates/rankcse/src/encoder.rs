//! Sentence encoder wrapper with two forward modes.
//!
//! ```text
//! token ids ──> Backbone ──> hidden states ──> Pooler ──> [MlpLayer] ──> embeddings
//!                                                                            │
//!             SentenceEmbedding mode: return embeddings ◄────────────────────┤
//!                                                                            │
//!             Contrastive mode: split views ─> gather ─> ContrastiveLoss ─> loss
//! ```
//!
//! The mode is chosen per call. Nothing computed in one call survives into
//! the next; the only persistent state is the parameters held by the
//! backbone, projection head and LM head, plus the immutable configuration.

use std::sync::Arc;

use candle_core::{IndexOp, Tensor};
use candle_nn::VarBuilder;

use crate::backbone::{Backbone, BackboneInput, BackboneOutput, LmHead};
use crate::config::RankCseConfig;
use crate::distributed::{Collective, EmbeddingGatherer};
use crate::error::{RankCseError, RankCseResult};
use crate::pooling::Pooler;
use crate::projection::MlpLayer;
use crate::training::loss::{ContrastiveLoss, LossComponents};
use crate::training::mlm::masked_lm_loss;

/// Single-view batch for sentence-embedding mode.
#[derive(Debug, Clone)]
pub struct SentenceBatch {
    /// `(batch, seq_len)` token ids.
    pub input_ids: Tensor,
    /// `(batch, seq_len)` attention mask.
    pub attention_mask: Tensor,
    /// `(batch, seq_len)` segment ids.
    pub token_type_ids: Option<Tensor>,
}

/// Multi-view batch for contrastive training.
///
/// View 0 and 1 are the positive pair; view 2, when present, is the hard
/// negative.
#[derive(Debug, Clone)]
pub struct ContrastiveBatch {
    /// `(batch, num_sent, seq_len)` token ids, `num_sent` in `{2, 3}`.
    pub input_ids: Tensor,
    /// `(batch, num_sent, seq_len)` attention mask.
    pub attention_mask: Tensor,
    /// `(batch, num_sent, seq_len)` segment ids.
    pub token_type_ids: Option<Tensor>,
    /// `(batch, num_sent, seq_len)` masked token ids for the MLM term.
    pub mlm_input_ids: Option<Tensor>,
    /// `(batch, num_sent, seq_len)` MLM labels, `-100` for unmasked tokens.
    pub mlm_labels: Option<Tensor>,
    /// `(batch, d)` auxiliary distances for the rank-correlation target.
    pub distances: Option<Tensor>,
}

/// Output of sentence-embedding mode.
#[derive(Debug, Clone)]
pub struct SentenceEmbeddingOutput {
    /// `(batch, hidden)` sentence embeddings.
    pub pooler_output: Tensor,
    /// `(batch, seq_len, hidden)` final-layer states.
    pub last_hidden_state: Tensor,
    /// Per-layer states when the pooler needed them.
    pub hidden_states: Option<Vec<Tensor>>,
    /// The backbone's own pooled output, when the backbone has a pooling head.
    pub backbone_pooler_output: Option<Tensor>,
}

/// Output of contrastive mode.
#[derive(Debug, Clone)]
pub struct ContrastiveOutput {
    /// Scalar total loss.
    pub loss: Tensor,
    /// Contrastive logits (global batch when gathered).
    pub logits: Tensor,
    /// Rank-correlation target, when the rank term is enabled.
    pub rank_target: Option<Tensor>,
    /// Scalar values for logging.
    pub components: LossComponents,
    /// Per-layer states of the main backbone pass, when requested.
    pub hidden_states: Option<Vec<Tensor>>,
}

/// Forward request: one variant per mode.
#[derive(Debug, Clone)]
pub enum ForwardInput {
    SentenceEmbedding(SentenceBatch),
    Contrastive(ContrastiveBatch),
}

/// Forward result, mirroring [`ForwardInput`].
#[derive(Debug, Clone)]
pub enum ForwardOutput {
    SentenceEmbedding(SentenceEmbeddingOutput),
    Contrastive(ContrastiveOutput),
}

/// Contrastive sentence encoder over a shared backbone.
pub struct ContrastiveEncoder<B: Backbone> {
    backbone: B,
    config: RankCseConfig,
    pooler: Pooler,
    mlp: Option<MlpLayer>,
    lm_head: Option<Box<dyn LmHead>>,
    gatherer: Option<EmbeddingGatherer>,
    loss: ContrastiveLoss,
    training: bool,
}

impl<B: Backbone> ContrastiveEncoder<B> {
    /// Build the encoder.
    ///
    /// The projection head is created under `vb.pp("mlp")` when the pooler is
    /// `cls`. The encoder starts in training mode.
    ///
    /// # Errors
    /// - `RankCseError::ConfigError` if the configuration is invalid
    pub fn new(backbone: B, config: RankCseConfig, vb: VarBuilder) -> RankCseResult<Self> {
        let loss = ContrastiveLoss::new(&config)?;
        let pooler_type = config.pooling.pooler_type;
        let mlp = if pooler_type.uses_projection_head() {
            Some(MlpLayer::new(backbone.hidden_size(), vb.pp("mlp"))?)
        } else {
            None
        };

        tracing::info!(
            "ContrastiveEncoder: pooler={}, projection_head={}, temperature={}, rank_loss={} ({})",
            pooler_type,
            mlp.is_some(),
            config.contrastive.temperature,
            config.rank.enabled,
            config.rank.combination
        );

        Ok(Self {
            backbone,
            pooler: Pooler::new(pooler_type),
            config,
            mlp,
            lm_head: None,
            gatherer: None,
            loss,
            training: true,
        })
    }

    /// Attach the masked-language-model head.
    ///
    /// # Errors
    /// - `RankCseError::UnsupportedConfig` if `mlm.enabled` is false
    pub fn with_lm_head(mut self, head: Box<dyn LmHead>) -> RankCseResult<Self> {
        if !self.config.mlm.enabled {
            return Err(RankCseError::unsupported(
                "an LM head was attached but [mlm] enabled = false",
            ));
        }
        self.lm_head = Some(head);
        Ok(self)
    }

    /// Attach a process group. Embeddings are gathered across it during
    /// training-mode contrastive forwards.
    pub fn with_collective(mut self, collective: Arc<dyn Collective>) -> Self {
        tracing::info!(
            "ContrastiveEncoder: joined process group as rank {} of {}",
            collective.rank(),
            collective.world_size()
        );
        self.gatherer = Some(EmbeddingGatherer::new(collective));
        self
    }

    /// Enable training mode (dropout on, gathering on).
    pub fn train(&mut self) {
        self.training = true;
    }

    /// Enable evaluation mode (dropout off, gathering off).
    pub fn eval(&mut self) {
        self.training = false;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn backbone(&self) -> &B {
        &self.backbone
    }

    pub fn config(&self) -> &RankCseConfig {
        &self.config
    }

    pub fn pooler(&self) -> &Pooler {
        &self.pooler
    }

    pub fn projection_head(&self) -> Option<&MlpLayer> {
        self.mlp.as_ref()
    }

    /// Run the forward pass selected by `input`.
    pub fn forward(&self, input: &ForwardInput) -> RankCseResult<ForwardOutput> {
        match input {
            ForwardInput::SentenceEmbedding(batch) => {
                self.sentence_embedding(batch).map(ForwardOutput::SentenceEmbedding)
            }
            ForwardInput::Contrastive(batch) => {
                self.contrastive_forward(batch).map(ForwardOutput::Contrastive)
            }
        }
    }

    /// Pool one view per sentence; no loss is computed.
    ///
    /// The projection head is applied unless `pooling.mlp_only_train` is set.
    pub fn sentence_embedding(&self, batch: &SentenceBatch) -> RankCseResult<SentenceEmbeddingOutput> {
        let outputs = self.backbone.forward(
            &BackboneInput {
                input_ids: &batch.input_ids,
                attention_mask: &batch.attention_mask,
                token_type_ids: batch.token_type_ids.as_ref(),
                output_hidden_states: self.pooler.pooler_type().needs_hidden_states(),
            },
            self.training,
        )?;

        let mut pooled = self.pooler.pool(&batch.attention_mask, &outputs)?;
        if let Some(mlp) = self.mlp.as_ref().filter(|_| !self.config.pooling.mlp_only_train) {
            pooled = mlp.forward(&pooled)?;
        }

        let backbone_pooler_output = if self.config.pooling.backbone_pooling_layer {
            outputs.pooler_output
        } else {
            None
        };

        Ok(SentenceEmbeddingOutput {
            pooler_output: pooled,
            last_hidden_state: outputs.last_hidden_state,
            hidden_states: outputs.hidden_states,
            backbone_pooler_output,
        })
    }

    /// Contrastive training forward over a multi-view batch.
    ///
    /// # Errors
    /// - `RankCseError::InvalidInput` for malformed batches
    /// - `RankCseError::UnsupportedConfig` for three views with the rank term
    ///   enabled, or MLM inputs without an LM head
    /// - `RankCseError::DimensionMismatch` if the distance rows differ from
    ///   the batch size or the LM head's logits width differs from its
    ///   vocabulary size
    pub fn contrastive_forward(&self, batch: &ContrastiveBatch) -> RankCseResult<ContrastiveOutput> {
        let (batch_size, num_sent, seq_len) = batch
            .input_ids
            .dims3()
            .map_err(|_| {
                RankCseError::invalid_input(format!(
                    "contrastive input_ids must be (batch, num_sent, seq_len), got {:?}",
                    batch.input_ids.dims()
                ))
            })?;
        if !(2..=3).contains(&num_sent) {
            return Err(RankCseError::invalid_input(format!(
                "num_sent must be 2 (pair) or 3 (pair + hard negative), got {}",
                num_sent
            )));
        }
        check_same_shape("attention_mask", &batch.input_ids, &batch.attention_mask)?;
        if let Some(tt) = &batch.token_type_ids {
            check_same_shape("token_type_ids", &batch.input_ids, tt)?;
        }

        let rows = batch_size * num_sent;
        let input_ids = flatten_views(&batch.input_ids, rows, seq_len)?;
        let attention_mask = flatten_views(&batch.attention_mask, rows, seq_len)?;
        let token_type_ids = batch
            .token_type_ids
            .as_ref()
            .map(|t| flatten_views(t, rows, seq_len))
            .transpose()?;
        let output_hidden_states = self.pooler.pooler_type().needs_hidden_states();

        let outputs = self.backbone.forward(
            &BackboneInput {
                input_ids: &input_ids,
                attention_mask: &attention_mask,
                token_type_ids: token_type_ids.as_ref(),
                output_hidden_states,
            },
            self.training,
        )?;

        let mlm_outputs = match (&batch.mlm_input_ids, &batch.mlm_labels) {
            (Some(mlm_ids), Some(labels)) => {
                if self.lm_head.is_none() {
                    return Err(RankCseError::unsupported(
                        "MLM inputs were supplied but no LM head is attached",
                    ));
                }
                check_same_shape("mlm_input_ids", &batch.input_ids, mlm_ids)?;
                let mlm_ids = flatten_views(mlm_ids, rows, seq_len)?;
                let mlm_out = self.backbone.forward(
                    &BackboneInput {
                        input_ids: &mlm_ids,
                        attention_mask: &attention_mask,
                        token_type_ids: token_type_ids.as_ref(),
                        output_hidden_states,
                    },
                    self.training,
                )?;
                Some((mlm_out, labels))
            }
            _ => None,
        };

        let views = self.pool_views(&attention_mask, &outputs, batch_size, num_sent)?;
        let z1 = view(&views, 0)?;
        let z2 = view(&views, 1)?;
        let z3 = if num_sent == 3 { Some(view(&views, 2)?) } else { None };

        let (z1, z2, z3, local_offset) = match self.gatherer.as_ref().filter(|_| self.training) {
            Some(gatherer) => {
                // Gather order is part of the collective protocol: hard
                // negative first, then view 0, then view 1.
                let z3 = z3.as_ref().map(|z| gatherer.gather(z)).transpose()?;
                let z1 = gatherer.gather(&z1)?;
                let z2 = gatherer.gather(&z2)?;
                (z1, z2, z3, gatherer.rank() * batch_size)
            }
            None => (z1, z2, z3, 0),
        };

        if let Some(distances) = &batch.distances {
            let n = distances.dim(0).map_err(|e| map_candle("distance rows", e))?;
            if n != batch_size {
                return Err(RankCseError::DimensionMismatch {
                    expected: batch_size,
                    got: n,
                });
            }
        }

        let mut out = self.loss.compute(
            &z1,
            &z2,
            z3.as_ref(),
            batch.distances.as_ref(),
            local_offset,
        )?;

        if let (Some((mlm_out, labels)), Some(head)) = (mlm_outputs, self.lm_head.as_ref()) {
            let prediction_scores = head.forward(&mlm_out.last_hidden_state)?;
            let vocab = prediction_scores
                .dims()
                .last()
                .copied()
                .unwrap_or_default();
            if vocab != head.vocab_size() {
                return Err(RankCseError::DimensionMismatch {
                    expected: head.vocab_size(),
                    got: vocab,
                });
            }
            let mlm_loss = masked_lm_loss(&prediction_scores, labels)?;
            out = out.with_mlm_term(&mlm_loss, self.config.mlm.weight)?;
        }

        tracing::debug!(
            "Contrastive forward: batch={}, views={}, contrastive={:.4}, rank={:.4} ({} entries), mlm={:.4}, total={:.4}",
            batch_size,
            num_sent,
            out.components.contrastive,
            out.components.rank,
            out.components.rank_entries,
            out.components.mlm,
            out.components.total
        );

        Ok(ContrastiveOutput {
            loss: out.loss,
            logits: out.logits,
            rank_target: out.rank_target,
            components: out.components,
            hidden_states: outputs.hidden_states,
        })
    }

    /// Pool, restore `(batch, num_sent, hidden)`, then project.
    fn pool_views(
        &self,
        attention_mask: &Tensor,
        outputs: &BackboneOutput,
        batch_size: usize,
        num_sent: usize,
    ) -> RankCseResult<Tensor> {
        let pooled = self.pooler.pool(attention_mask, outputs)?;
        let hidden = pooled.dim(1).map_err(|e| map_candle("pooled width", e))?;
        let pooled = pooled
            .reshape((batch_size, num_sent, hidden))
            .map_err(|e| map_candle("restore views", e))?;
        match &self.mlp {
            Some(mlp) => mlp.forward(&pooled),
            None => Ok(pooled),
        }
    }
}

fn check_same_shape(name: &str, reference: &Tensor, other: &Tensor) -> RankCseResult<()> {
    if reference.dims() != other.dims() {
        return Err(RankCseError::invalid_input(format!(
            "{} shape {:?} does not match input_ids shape {:?}",
            name,
            other.dims(),
            reference.dims()
        )));
    }
    Ok(())
}

fn flatten_views(t: &Tensor, rows: usize, seq_len: usize) -> RankCseResult<Tensor> {
    t.reshape((rows, seq_len))
        .map_err(|e| map_candle("flatten views", e))
}

fn view(views: &Tensor, index: usize) -> RankCseResult<Tensor> {
    views
        .i((.., index))
        .map_err(|e| map_candle("select view", e))
}

fn map_candle(op: &str, e: candle_core::Error) -> RankCseError {
    RankCseError::tensor(&format!("Encoder {} failed", op), e)
}
