// SHARED CONSENSUS STATE
// The single live copy of the thread records and the aggregator, behind one lock.
//
// SAFETY INVARIANTS:
// 1. Every read or write of the epoch, leader index, quorum or aggregator goes through this lock
// 2. No caller can observe a half-applied update (closures run to completion under the lock)
// 3. The lock is never held across an await point

use crate::aggregator::FinalizationAggregator;
use log::{debug, warn};
use parking_lot::Mutex;
use protochain_core::{ApprovementThread, ConsensusResult, GenerationThread};
use std::collections::HashMap;
use std::sync::Arc;

/// Blocks this node has seen from one leader in the current epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderTip {
    pub first_block_hash: String,
    pub last_index: i64,
    pub last_hash: String,
}

#[derive(Debug)]
pub struct ConsensusState {
    pub approvement: ApprovementThread,
    pub generation: GenerationThread,
    pub aggregator: FinalizationAggregator,
    /// Cleared when the persisted core version is newer than ours.
    pub eligible_to_finalize: bool,
    /// Leader key -> tip, current epoch only.
    pub leader_tips: HashMap<String, LeaderTip>,
}

impl ConsensusState {
    pub fn new(approvement: ApprovementThread, generation: GenerationThread) -> Self {
        let mut aggregator = FinalizationAggregator::new();
        aggregator.register_epoch(&approvement.epoch);
        ConsensusState {
            approvement,
            generation,
            aggregator,
            eligible_to_finalize: true,
            leader_tips: HashMap::new(),
        }
    }

    /// Remember a block produced by `leader` at `index`.
    pub fn observe_block(&mut self, leader: &str, index: u64, hash: &str) {
        let tip = self
            .leader_tips
            .entry(leader.to_string())
            .or_insert_with(|| LeaderTip {
                first_block_hash: String::new(),
                last_index: -1,
                last_hash: String::new(),
            });
        if index == 0 {
            tip.first_block_hash = hash.to_string();
        }
        if index as i64 > tip.last_index {
            tip.last_index = index as i64;
            tip.last_hash = hash.to_string();
        }
    }
}

/// Cloneable handle every duty holds onto.
#[derive(Clone)]
pub struct ConsensusHandle {
    inner: Arc<Mutex<ConsensusState>>,
}

impl ConsensusHandle {
    pub fn new(state: ConsensusState) -> Self {
        ConsensusHandle {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&ConsensusState) -> R) -> R {
        let guard = self.inner.lock();
        f(&guard)
    }

    /// Apply a transactional update. Closures must validate before mutating.
    pub fn update<R>(&self, f: impl FnOnce(&mut ConsensusState) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }

    /// Copies of both thread records taken atomically.
    pub fn snapshot(&self) -> (ApprovementThread, GenerationThread) {
        self.read(|state| (state.approvement.clone(), state.generation.clone()))
    }

    /// Clear transient data and return the records to persist.
    pub fn checkpoint(&self) -> ConsensusResult<(ApprovementThread, GenerationThread)> {
        self.update(|state| {
            let finalized = state.aggregator.checkpoint();
            if !finalized.is_empty() {
                debug!("Checkpoint discards {} finalized proofs", finalized.len());
            }
            state.approvement.clear_cache();
            Ok((state.approvement.clone(), state.generation.clone()))
        })
    }

    pub fn is_eligible_to_finalize(&self) -> bool {
        self.read(|state| state.eligible_to_finalize)
    }

    pub fn mark_ineligible(&self, reason: &str) {
        self.update(|state| {
            if state.eligible_to_finalize {
                warn!("Node is no longer eligible to finalize: {}", reason);
            }
            state.eligible_to_finalize = false;
        })
    }
}
