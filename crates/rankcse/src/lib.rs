//! Contrastive sentence-embedding training objective with a rank-correlation
//! auxiliary loss.
//!
//! A pretrained transformer backbone (supplied by the caller through the
//! [`Backbone`] trait) encodes two dropout views of every sentence. The views
//! are pooled into sentence vectors, optionally projected, and trained with an
//! in-batch InfoNCE loss. A second term pulls the temperature-rescaled cosine
//! similarities towards a Spearman rank-correlation target computed from
//! per-instance auxiliary distances.
//!
//! # Architecture
//!
//! - **RankCseConfig**: immutable run configuration (TOML + env overrides)
//! - **Pooler** / **MlpLayer**: hidden states to sentence vectors
//! - **Similarity**: temperature-scaled cosine matrix
//! - **spearman_correlation**: rank-correlation target, never differentiated
//! - **EmbeddingGatherer**: gradient-preserving all-gather over a [`Collective`]
//! - **ContrastiveLoss**: InfoNCE + thresholded rank MSE, weighted sum or hinge
//! - **ContrastiveEncoder**: the two forward modes over a backbone
//!
//! # Example
//!
//! ```rust
//! use rankcse::{PoolerType, RankCseConfig};
//!
//! let config = RankCseConfig::from_toml_str("[pooling]\npooler_type = \"avg\"\n").unwrap();
//! assert_eq!(config.pooling.pooler_type, PoolerType::Avg);
//! assert_eq!(config.contrastive.temperature, 0.05);
//! assert!(config.rank.enabled);
//! ```

pub mod backbone;
pub mod config;
pub mod distributed;
pub mod encoder;
pub mod error;
pub mod pooling;
pub mod projection;
pub mod rank_corr;
pub mod similarity;
pub mod training;

pub use backbone::{Backbone, BackboneInput, BackboneOutput, LmHead};
pub use config::{
    ContrastiveConfig, LossCombination, MlmConfig, PoolerType, PoolingConfig, RankCseConfig,
    RankConfig, RankMetric,
};
pub use distributed::{Collective, EmbeddingGatherer, InProcessCollective, InProcessGroup, SingleProcess};
pub use encoder::{
    ContrastiveBatch, ContrastiveEncoder, ContrastiveOutput, ForwardInput, ForwardOutput,
    SentenceBatch, SentenceEmbeddingOutput,
};
pub use error::{RankCseError, RankCseResult};
pub use pooling::Pooler;
pub use projection::MlpLayer;
pub use rank_corr::spearman_correlation;
pub use similarity::Similarity;
pub use training::{masked_lm_loss, ContrastiveLoss, ContrastiveLossOutput, LossComponents, IGNORE_INDEX};
