//! Process topology and the all-gather primitive.
//!
//! The gatherer never asks a global runtime "is a process group active" or
//! "what is my rank". It is handed a [`Collective`] instead, so the same code
//! runs against a real process group, a single process, or the in-process
//! thread group used by the tests.

use std::sync::{Arc, Barrier};

use candle_core::Tensor;
use parking_lot::Mutex;

use crate::error::{RankCseError, RankCseResult};

/// Topology descriptor plus the blocking all-gather primitive.
///
/// `all_gather` is a synchronisation barrier: every participant must call it
/// the same number of times, in the same order, or the group hangs. There is
/// no timeout.
pub trait Collective: Send + Sync {
    /// This participant's rank, `0..world_size`.
    fn rank(&self) -> usize;

    /// Number of participants.
    fn world_size(&self) -> usize;

    /// Exchange `tensor` with every participant.
    ///
    /// Returns one shard per rank in ascending rank order. Shards are
    /// detached copies, including this participant's own.
    fn all_gather(&self, tensor: &Tensor) -> RankCseResult<Vec<Tensor>>;
}

/// Trivial topology: one participant, no communication.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_gather(&self, tensor: &Tensor) -> RankCseResult<Vec<Tensor>> {
        Ok(vec![tensor.detach()])
    }
}

struct Exchange {
    slots: Mutex<Vec<Option<Tensor>>>,
    barrier: Barrier,
}

/// Thread-backed process group: each participant runs on its own thread and
/// they exchange tensors through shared memory.
pub struct InProcessGroup;

impl InProcessGroup {
    /// Create `world_size` connected participants, indexed by rank.
    ///
    /// # Errors
    /// - `RankCseError::Collective` if `world_size` is zero
    pub fn new(world_size: usize) -> RankCseResult<Vec<InProcessCollective>> {
        if world_size == 0 {
            return Err(RankCseError::Collective {
                message: "world size must be at least 1".to_string(),
            });
        }
        let exchange = Arc::new(Exchange {
            slots: Mutex::new(vec![None; world_size]),
            barrier: Barrier::new(world_size),
        });
        Ok((0..world_size)
            .map(|rank| InProcessCollective {
                rank,
                world_size,
                exchange: Arc::clone(&exchange),
            })
            .collect())
    }
}

/// One participant of an [`InProcessGroup`].
#[derive(Clone)]
pub struct InProcessCollective {
    rank: usize,
    world_size: usize,
    exchange: Arc<Exchange>,
}

impl std::fmt::Debug for InProcessCollective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessCollective")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .finish()
    }
}

impl Collective for InProcessCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_gather(&self, tensor: &Tensor) -> RankCseResult<Vec<Tensor>> {
        self.exchange.slots.lock()[self.rank] = Some(tensor.detach());

        // Publish, read, then wait again so no participant overwrites its
        // slot for the next gather before everyone has read this one.
        self.exchange.barrier.wait();
        let gathered: Option<Vec<Tensor>> = self.exchange.slots.lock().iter().cloned().collect();
        self.exchange.barrier.wait();

        gathered.ok_or_else(|| RankCseError::Collective {
            message: format!("rank {} observed an empty slot after the barrier", self.rank),
        })
    }
}
