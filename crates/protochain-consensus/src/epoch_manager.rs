// EPOCH LIFECYCLE MANAGER
// Owns the active epoch record: liveness, leader lookup, succession.
//
// SAFETY INVARIANTS:
// 1. Epoch replacement is atomic and only moves to a strictly higher epoch id
// 2. Replacing an epoch drops every in-flight proof of the old epoch
// 3. The quorum of every replaced epoch stays on record for validating late proofs
// 4. A node whose core version is older than the network's never finalizes

use crate::aggregator::cache_key_epoch;
use crate::state::{ConsensusHandle, ConsensusState};
use log::{info, warn};
use protochain_core::selection::{leaders_sequence, select_quorum};
use protochain_core::{
    blake3_hex, ConsensusError, ConsensusResult, EpochFinalizationProof, EpochRecord,
    SignatureMap,
};

#[derive(Clone)]
pub struct EpochLifecycleManager {
    handle: ConsensusHandle,
    local_major: i64,
}

impl EpochLifecycleManager {
    pub fn new(handle: ConsensusHandle, local_major: i64) -> Self {
        EpochLifecycleManager {
            handle,
            local_major,
        }
    }

    pub fn handle(&self) -> &ConsensusHandle {
        &self.handle
    }

    /// `start_timestamp + EPOCH_TIME > now`
    pub fn is_active(&self, now_ms: u64) -> ConsensusResult<bool> {
        self.handle
            .read(|state| state.approvement.is_epoch_active(now_ms))
    }

    pub fn quorum_majority(&self) -> usize {
        self.handle
            .read(|state| state.approvement.epoch.quorum_majority())
    }

    pub fn current_leader(&self) -> ConsensusResult<String> {
        self.handle.read(|state| {
            state
                .approvement
                .epoch
                .current_leader()
                .map(str::to_string)
        })
    }

    pub fn has_next_candidate(&self) -> bool {
        self.handle
            .read(|state| state.approvement.epoch.has_next_candidate())
    }

    pub fn epoch(&self) -> EpochRecord {
        self.handle.read(|state| state.approvement.epoch.clone())
    }

    /// Refuse finalization duties when the network runs a newer core.
    pub fn check_version(&self) -> ConsensusResult<()> {
        let required = self
            .handle
            .read(|state| state.approvement.core_major_version);
        if required > self.local_major {
            let err = ConsensusError::VersionMismatch {
                local: self.local_major,
                required,
            };
            self.handle.mark_ineligible(&err.to_string());
            return Err(err);
        }
        Ok(())
    }

    /// Deterministic successor of the active epoch.
    ///
    /// Every honest node derives the same record from the same active epoch.
    pub fn propose_next_epoch(&self) -> ConsensusResult<EpochRecord> {
        self.handle.read(|state| {
            let current = &state.approvement.epoch;
            let params = &state.approvement.network_parameters;
            let epoch_time = params.epoch_time()?;

            let hash = blake3_hex(&format!("{}:{}", current.hash, current.id));
            let quorum_size = params.quorum_size().unwrap_or(current.quorum.len());
            let quorum = if current.pools_registry.is_empty() {
                current.quorum.clone()
            } else {
                select_quorum(&current.pools_registry, quorum_size, &hash)
            };

            let next = EpochRecord {
                id: current.id + 1,
                leaders_sequence: leaders_sequence(&current.pools_registry, &quorum, &hash),
                hash,
                pools_registry: current.pools_registry.clone(),
                quorum,
                start_timestamp: current.start_timestamp.saturating_add(epoch_time),
                current_leader_index: 0,
            };
            next.validate()?;
            Ok(next)
        })
    }

    /// Atomically swap the active epoch.
    pub fn replace_epoch(&self, next: EpochRecord) -> ConsensusResult<()> {
        next.validate()?;
        self.handle.update(|state| {
            let old_id = state.approvement.epoch.id;
            if next.id <= old_id {
                return Err(ConsensusError::InvalidEpochTransition(format!(
                    "epoch {} cannot replace epoch {}",
                    next.id, old_id
                )));
            }

            state.generation.enter_epoch(&next.full_id())?;
            state.aggregator.invalidate_epoch(old_id);
            state.aggregator.register_epoch(&next);
            state.leader_tips.clear();

            let cached = state.approvement.cache.len();
            state
                .approvement
                .cache
                .retain(|key, _| cache_key_epoch(key).map_or(false, |epoch_id| epoch_id >= next.id));

            info!(
                "Epoch {} replaced by {} ({} quorum members, {} leaders, {} superseded proofs discarded)",
                old_id,
                next.full_id(),
                next.quorum.len(),
                next.leaders_sequence.len(),
                cached - state.approvement.cache.len()
            );
            state.approvement.epoch = next;
            Ok(())
        })
    }

    /// Statement the quorum signs to close the active epoch.
    pub fn epoch_finalization_statement(&self) -> ConsensusResult<EpochFinalizationProof> {
        self.handle.read(finalization_statement)
    }
}

/// Closing statement for the active epoch, built from the blocks seen from its last leader.
pub fn finalization_statement(state: &ConsensusState) -> ConsensusResult<EpochFinalizationProof> {
    let epoch = &state.approvement.epoch;
    let last_leader = epoch.current_leader()?;
    let (last_block_index, last_block_hash, first_hash) = match state.leader_tips.get(last_leader) {
        Some(tip) => (
            tip.last_index,
            tip.last_hash.clone(),
            tip.first_block_hash.clone(),
        ),
        None => {
            warn!(
                "No blocks observed from last leader {} of epoch {}",
                last_leader, epoch.id
            );
            (-1, String::new(), String::new())
        }
    };
    Ok(EpochFinalizationProof {
        last_leader_index: epoch.current_leader_index,
        last_block_index,
        last_block_hash,
        first_block_hash_by_last_leader: first_hash,
        signatures: SignatureMap::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{ProofBody, ProofId};
    use protochain_core::params::{EPOCH_TIME, LEADERSHIP_TIMEFRAME, QUORUM_SIZE};
    use protochain_core::{
        ApprovementThread, FinalizationProof, GenerationThread, NetworkParameters, PoolRecord,
    };
    use std::collections::BTreeMap;

    fn manager(version: i64) -> EpochLifecycleManager {
        let pools: BTreeMap<String, PoolRecord> = ["A", "B", "C", "D"]
            .iter()
            .map(|key| {
                (
                    key.to_string(),
                    PoolRecord {
                        total_stake: 10,
                        url: String::new(),
                    },
                )
            })
            .collect();
        let approvement = ApprovementThread {
            core_major_version: version,
            network_parameters: NetworkParameters::new()
                .with(EPOCH_TIME, 10_000u64)
                .with(LEADERSHIP_TIMEFRAME, 1_000u64)
                .with(QUORUM_SIZE, 3u64),
            epoch: EpochRecord {
                id: 0,
                hash: "genesis".into(),
                pools_registry: pools,
                quorum: vec!["A".into(), "B".into(), "C".into()],
                leaders_sequence: vec!["B".into(), "A".into(), "C".into()],
                start_timestamp: 1_000,
                current_leader_index: 0,
            },
            cache: BTreeMap::new(),
        };
        let state = ConsensusState::new(approvement, GenerationThread::genesis("devnet"));
        EpochLifecycleManager::new(ConsensusHandle::new(state), 1)
    }

    #[test]
    fn test_is_active() {
        let manager = manager(1);
        assert!(manager.is_active(10_999).unwrap());
        assert!(!manager.is_active(11_000).unwrap());
    }

    #[test]
    fn test_leader_and_majority() {
        let manager = manager(1);
        assert_eq!(manager.current_leader().unwrap(), "B");
        assert_eq!(manager.quorum_majority(), 3);
        assert!(manager.has_next_candidate());
    }

    #[test]
    fn test_version_mismatch_marks_ineligible() {
        let manager = manager(2);
        assert_eq!(
            manager.check_version(),
            Err(ConsensusError::VersionMismatch {
                local: 1,
                required: 2
            })
        );
        assert!(!manager.handle().is_eligible_to_finalize());
    }

    #[test]
    fn test_matching_version_stays_eligible() {
        let manager = manager(1);
        assert!(manager.check_version().is_ok());
        assert!(manager.handle().is_eligible_to_finalize());
    }

    #[test]
    fn test_propose_next_epoch_is_deterministic() {
        let manager = manager(1);
        let a = manager.propose_next_epoch().unwrap();
        let b = manager.propose_next_epoch().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.id, 1);
        assert_eq!(a.quorum.len(), 3);
        assert_eq!(a.start_timestamp, 11_000);
        assert_eq!(a.current_leader_index, 0);
    }

    #[test]
    fn test_replace_epoch_invalidates_old_proofs() {
        let manager = manager(1);
        let id = ProofId::Block {
            epoch_id: 0,
            block_id: "0:B:0".into(),
        };
        manager
            .handle()
            .update(|state| {
                state.aggregator.open(
                    id.clone(),
                    ProofBody::Block(FinalizationProof::new("p".into(), "0:B:0".into(), "h".into())),
                )
            })
            .unwrap();

        let next = manager.propose_next_epoch().unwrap();
        manager.replace_epoch(next.clone()).unwrap();

        assert_eq!(manager.epoch().id, 1);
        manager.handle().read(|state| {
            assert!(!state.aggregator.is_open(&id));
            assert!(state.aggregator.knows_epoch(0));
            assert!(state.aggregator.knows_epoch(1));
            assert_eq!(state.generation.epoch_full_id, next.full_id());
        });
    }

    #[test]
    fn test_replace_epoch_rejects_regression() {
        let manager = manager(1);
        let mut stale = manager.epoch();
        stale.hash = "other".into();
        assert!(matches!(
            manager.replace_epoch(stale),
            Err(ConsensusError::InvalidEpochTransition(_))
        ));
    }

    #[test]
    fn test_epoch_finalization_statement_uses_tips() {
        let manager = manager(1);
        manager.handle().update(|state| {
            state.observe_block("B", 0, "first");
            state.observe_block("B", 1, "second");
        });
        let statement = manager.epoch_finalization_statement().unwrap();
        assert_eq!(statement.last_leader_index, 0);
        assert_eq!(statement.last_block_index, 1);
        assert_eq!(statement.last_block_hash, "second");
        assert_eq!(statement.first_block_hash_by_last_leader, "first");
    }

    #[test]
    fn test_replace_epoch_discards_superseded_proofs() {
        let manager = manager(1);
        manager.handle().update(|state| {
            for key in ["AFP:0:B:0", "AFP:0:B:1", "ALRP:0:0", "AEFP:0"] {
                state
                    .approvement
                    .cache
                    .insert(key.to_string(), serde_json::json!({}));
            }
        });

        let next = manager.propose_next_epoch().unwrap();
        let full_id = next.full_id();
        manager.replace_epoch(next).unwrap();

        manager.handle().read(|state| {
            assert!(state.approvement.cache.is_empty());
            assert_eq!(state.generation.epoch_full_id, full_id);
            assert_eq!(state.generation.next_index, 0);
        });
    }

    #[test]
    fn test_rejected_transition_leaves_state_untouched() {
        let manager = manager(1);
        let id = ProofId::Epoch(0);
        manager
            .handle()
            .update(|state| {
                state.observe_block("B", 0, "first");
                state.approvement.cache.insert("AFP:0:B:0".into(), serde_json::json!({}));
                state.aggregator.open(
                    id.clone(),
                    ProofBody::Epoch(finalization_statement(state)?),
                )
            })
            .unwrap();
        let cursor = manager.handle().read(|state| state.generation.clone());

        let mut stale = manager.epoch();
        stale.hash = "other".into();
        assert!(manager.replace_epoch(stale).is_err());

        manager.handle().read(|state| {
            assert!(state.aggregator.is_open(&id));
            assert_eq!(state.generation, cursor);
            assert!(state.leader_tips.contains_key("B"));
            assert_eq!(state.approvement.cache.len(), 1);
        });
    }
}
