//! Shared fixtures for the integration tests: a small dropout backbone, a
//! linear LM head and seeded batch builders.

#![allow(dead_code)]

use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{Embedding, Linear, VarBuilder, VarMap};
use rand::Rng;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rankcse::{
    Backbone, BackboneInput, BackboneOutput, ContrastiveBatch, LmHead, RankCseError, RankCseResult,
};

pub const VOCAB: usize = 32;
pub const HIDDEN: usize = 8;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn tensor_err(e: candle_core::Error) -> RankCseError {
    RankCseError::TensorError {
        message: e.to_string(),
    }
}

/// Embedding table followed by residual tanh layers, with dropout in
/// training mode.
pub struct ToyBackbone {
    embeddings: Embedding,
    layers: Vec<Linear>,
    pooler: Linear,
    dropout: f32,
}

impl ToyBackbone {
    pub fn new(num_layers: usize, dropout: f32, vb: VarBuilder) -> candle_core::Result<Self> {
        let embeddings = candle_nn::embedding(VOCAB, HIDDEN, vb.pp("embeddings"))?;
        let layers = (0..num_layers)
            .map(|i| candle_nn::linear(HIDDEN, HIDDEN, vb.pp(format!("layer.{}", i))))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let pooler = candle_nn::linear(HIDDEN, HIDDEN, vb.pp("pooler"))?;
        Ok(Self {
            embeddings,
            layers,
            pooler,
            dropout,
        })
    }

    fn dropout(&self, h: Tensor, train: bool) -> candle_core::Result<Tensor> {
        if train && self.dropout > 0.0 {
            candle_nn::ops::dropout(&h, self.dropout)
        } else {
            Ok(h)
        }
    }

    fn run(&self, input: &BackboneInput<'_>, train: bool) -> candle_core::Result<BackboneOutput> {
        let mut h = self.dropout(self.embeddings.forward(input.input_ids)?, train)?;
        let mut states = vec![h.clone()];
        for layer in &self.layers {
            let update = layer.forward(&h)?.tanh()?;
            h = self.dropout((update + &h)?, train)?;
            states.push(h.clone());
        }
        let pooled = self.pooler.forward(&h.i((.., 0))?)?.tanh()?;
        Ok(BackboneOutput {
            last_hidden_state: h,
            pooler_output: Some(pooled),
            hidden_states: input.output_hidden_states.then_some(states),
        })
    }
}

impl Backbone for ToyBackbone {
    fn hidden_size(&self) -> usize {
        HIDDEN
    }

    fn forward(&self, input: &BackboneInput<'_>, train: bool) -> RankCseResult<BackboneOutput> {
        self.run(input, train).map_err(tensor_err)
    }
}

pub struct ToyLmHead {
    decoder: Linear,
}

impl ToyLmHead {
    pub fn new(vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            decoder: candle_nn::linear(HIDDEN, VOCAB, vb.pp("lm_head"))?,
        })
    }
}

impl LmHead for ToyLmHead {
    fn vocab_size(&self) -> usize {
        VOCAB
    }

    fn forward(&self, hidden_states: &Tensor) -> RankCseResult<Tensor> {
        self.decoder.forward(hidden_states).map_err(tensor_err)
    }
}

pub fn var_builder(varmap: &VarMap) -> VarBuilder<'static> {
    VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
}

pub fn rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

/// `(batch, num_sent, seq_len)` batch where every view of an instance holds
/// the same tokens, plus `(batch, dist_width)` distances.
pub fn contrastive_batch(
    rng: &mut ChaCha8Rng,
    batch: usize,
    num_sent: usize,
    seq_len: usize,
    dist_width: usize,
) -> ContrastiveBatch {
    let sentences: Vec<Vec<u32>> = (0..batch)
        .map(|_| (0..seq_len).map(|_| rng.gen_range(1..VOCAB as u32)).collect())
        .collect();
    let ids: Vec<u32> = sentences
        .iter()
        .flat_map(|s| std::iter::repeat(s.iter().copied()).take(num_sent).flatten())
        .collect();
    let distances: Vec<f32> = (0..batch * dist_width).map(|_| rng.gen_range(0.0..10.0)).collect();

    ContrastiveBatch {
        input_ids: Tensor::from_vec(ids, (batch, num_sent, seq_len), &Device::Cpu).unwrap(),
        attention_mask: Tensor::ones((batch, num_sent, seq_len), DType::U32, &Device::Cpu).unwrap(),
        token_type_ids: None,
        mlm_input_ids: None,
        mlm_labels: None,
        distances: Some(Tensor::from_vec(distances, (batch, dist_width), &Device::Cpu).unwrap()),
    }
}

pub fn scalar(t: &Tensor) -> f32 {
    t.to_dtype(DType::F32).unwrap().to_scalar::<f32>().unwrap()
}
