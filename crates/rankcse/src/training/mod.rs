//! Training objective.
//!
//! # Modules
//!
//! - [`loss`]: InfoNCE + thresholded rank-correlation MSE, combined by policy
//! - [`mlm`]: masked-language-model token cross-entropy

pub mod loss;
pub mod mlm;

pub use loss::{ContrastiveLoss, ContrastiveLossOutput, LossComponents};
pub use mlm::{masked_lm_loss, IGNORE_INDEX};
