//! Multi-process embedding gathering.
//!
//! # Modules
//!
//! - [`collective`]: injected topology + blocking all-gather
//! - [`gather`]: gradient-preserving global batch assembly
//!
//! Process-group setup and teardown belong to the caller. This module only
//! implements the gather protocol used inside the contrastive forward.

pub mod collective;
pub mod gather;

pub use collective::{Collective, InProcessCollective, InProcessGroup, SingleProcess};
pub use gather::EmbeddingGatherer;
