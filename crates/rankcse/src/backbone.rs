//! Contracts for the external collaborators: the pretrained transformer
//! backbone and the masked-language-model prediction head.
//!
//! Neither is implemented here. Any encoder that can turn flattened token
//! ids into per-token hidden states plugs in through [`Backbone`]; BERT and
//! RoBERTa style models differ only in their implementation of this trait.

use candle_core::Tensor;

use crate::error::RankCseResult;

/// Flattened inputs for a single backbone call.
#[derive(Debug, Clone, Copy)]
pub struct BackboneInput<'a> {
    /// Token ids `(rows, seq_len)`.
    pub input_ids: &'a Tensor,
    /// Attention mask `(rows, seq_len)`, 1 for real tokens and 0 for padding.
    pub attention_mask: &'a Tensor,
    /// Optional segment ids `(rows, seq_len)`.
    pub token_type_ids: Option<&'a Tensor>,
    /// Whether the hidden states of every layer must be returned.
    pub output_hidden_states: bool,
}

/// What a backbone returns for one call.
#[derive(Debug, Clone)]
pub struct BackboneOutput {
    /// Final-layer hidden states `(rows, seq_len, hidden)`.
    pub last_hidden_state: Tensor,
    /// Backbone-native pooled output `(rows, hidden)`, if the model has one.
    pub pooler_output: Option<Tensor>,
    /// Embedding output followed by every layer's hidden states, each
    /// `(rows, seq_len, hidden)`. Present when requested.
    pub hidden_states: Option<Vec<Tensor>>,
}

/// Pretrained transformer encoder.
///
/// `train` toggles stochastic layers (dropout). Two calls on the same input
/// in training mode are expected to differ, which is what makes the two
/// positive views of an instance distinct.
pub trait Backbone {
    /// Width of the hidden states.
    fn hidden_size(&self) -> usize;

    /// Encode a flattened batch.
    fn forward(&self, input: &BackboneInput<'_>, train: bool) -> RankCseResult<BackboneOutput>;
}

/// Token prediction head for the masked-language-model auxiliary term.
pub trait LmHead {
    /// Vocabulary size of the produced logits.
    fn vocab_size(&self) -> usize;

    /// Map `(rows, seq_len, hidden)` states to `(rows, seq_len, vocab)` logits.
    fn forward(&self, hidden_states: &Tensor) -> RankCseResult<Tensor>;
}
