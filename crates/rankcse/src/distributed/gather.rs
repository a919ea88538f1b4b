//! Gradient-preserving all-gather of embedding shards.
//!
//! After the collective exchange every participant holds the full global
//! batch, but only its own slot is the original graph-attached tensor. Remote
//! shards are detached leaves, so this participant's loss never sends
//! gradient into another participant's parameters.

use std::sync::Arc;

use candle_core::Tensor;

use super::collective::Collective;
use crate::error::{RankCseError, RankCseResult};

/// Builds global-batch embedding matrices on top of a [`Collective`].
#[derive(Clone)]
pub struct EmbeddingGatherer {
    collective: Arc<dyn Collective>,
}

impl EmbeddingGatherer {
    pub fn new(collective: Arc<dyn Collective>) -> Self {
        Self { collective }
    }

    pub fn rank(&self) -> usize {
        self.collective.rank()
    }

    pub fn world_size(&self) -> usize {
        self.collective.world_size()
    }

    /// Gather `local: (rows, hidden)` into `(rows · world_size, hidden)`.
    ///
    /// Concatenation follows ascending rank. Slot `rank` is replaced by
    /// `local` itself so its gradient linkage survives.
    ///
    /// # Errors
    /// - `RankCseError::Collective` if the collective returns the wrong
    ///   number of shards
    /// - `RankCseError::TensorError` if shard shapes disagree
    pub fn gather(&self, local: &Tensor) -> RankCseResult<Tensor> {
        let rank = self.collective.rank();
        let world_size = self.collective.world_size();

        let contiguous = local
            .contiguous()
            .map_err(|e| RankCseError::tensor("Gather contiguous copy failed", e))?;
        let mut shards = self.collective.all_gather(&contiguous)?;

        if shards.len() != world_size {
            return Err(RankCseError::Collective {
                message: format!(
                    "expected {} shards from all_gather, got {}",
                    world_size,
                    shards.len()
                ),
            });
        }
        shards[rank] = local.clone();

        tracing::debug!(rank, world_size, rows = local.dim(0).unwrap_or(0), "gathered embedding shard");

        Tensor::cat(&shards, 0).map_err(|e| RankCseError::tensor("Gather concat failed", e))
    }
}

impl std::fmt::Debug for EmbeddingGatherer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingGatherer")
            .field("rank", &self.rank())
            .field("world_size", &self.world_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::SingleProcess;
    use candle_core::{Device, Var};

    struct ShortCollective;

    impl Collective for ShortCollective {
        fn rank(&self) -> usize {
            1
        }
        fn world_size(&self) -> usize {
            2
        }
        fn all_gather(&self, tensor: &Tensor) -> RankCseResult<Vec<Tensor>> {
            Ok(vec![tensor.detach()])
        }
    }

    /// Pretends to be rank 1 of 2, with a fixed peer shard at rank 0.
    struct FixedPeer {
        peer: Tensor,
    }

    impl Collective for FixedPeer {
        fn rank(&self) -> usize {
            1
        }
        fn world_size(&self) -> usize {
            2
        }
        fn all_gather(&self, tensor: &Tensor) -> RankCseResult<Vec<Tensor>> {
            Ok(vec![self.peer.detach(), tensor.detach()])
        }
    }

    #[test]
    fn test_single_process_keeps_gradient() {
        let var = Var::from_tensor(
            &Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], (2, 2), &Device::Cpu).unwrap(),
        )
        .unwrap();
        let gatherer = EmbeddingGatherer::new(Arc::new(SingleProcess));
        let gathered = gatherer.gather(var.as_tensor()).unwrap();
        assert_eq!(gathered.dims(), &[2, 2]);

        let grads = gathered.sum_all().unwrap().backward().unwrap();
        assert!(grads.get(var.as_tensor()).is_some());
    }

    #[test]
    fn test_local_slot_placed_at_rank() {
        let peer = Tensor::zeros((1, 2), candle_core::DType::F32, &Device::Cpu).unwrap();
        let local = Var::from_tensor(
            &Tensor::from_vec(vec![5.0f32, 6.0], (1, 2), &Device::Cpu).unwrap(),
        )
        .unwrap();
        let gatherer = EmbeddingGatherer::new(Arc::new(FixedPeer { peer }));
        let gathered = gatherer.gather(local.as_tensor()).unwrap();
        let values: Vec<Vec<f32>> = gathered.to_vec2().unwrap();
        assert_eq!(values, vec![vec![0.0, 0.0], vec![5.0, 6.0]]);

        let grads = gathered.sum_all().unwrap().backward().unwrap();
        let g: Vec<Vec<f32>> = grads.get(local.as_tensor()).unwrap().to_vec2().unwrap();
        assert_eq!(g, vec![vec![1.0, 1.0]]);
    }

    #[test]
    fn test_wrong_shard_count_rejected() {
        let gatherer = EmbeddingGatherer::new(Arc::new(ShortCollective));
        let local = Tensor::zeros((1, 2), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            gatherer.gather(&local).unwrap_err(),
            RankCseError::Collective { .. }
        ));
    }
}
