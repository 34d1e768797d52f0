// LEADER ROTATION ENGINE
// Forward-only state machine over the leaders sequence of the active epoch.
//
// SAFETY INVARIANTS:
// 1. current_leader_index moves forward by exactly one per step, never backwards
// 2. The index saturates at the last leader; the epoch ends instead of wrapping
// 3. The read-check-increment of the index happens under the state lock
// 4. A missing LEADERSHIP_TIMEFRAME is a configuration fault, never retried

use crate::aggregator::{ProofBody, ProofId};
use crate::state::{ConsensusHandle, ConsensusState};
use log::{debug, info, warn};
use protochain_core::{
    count_quorum_signatures, ConsensusResult, EpochRecord, LeaderRotationProof,
    SignatureVerifier,
};
use std::collections::BTreeMap;

/// Result of one rotation tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    /// The current leader is still within its timeframe.
    Idle,
    /// Leadership moved one step forward; `request` is the statement the quorum must sign.
    Rotated {
        epoch_id: u64,
        from_index: usize,
        to_index: usize,
        skipped_leader: String,
        request: LeaderRotationProof,
    },
    /// The last leader's slot is over and the epoch has expired.
    EpochExhausted { epoch_id: u64 },
}

#[derive(Clone)]
pub struct LeaderRotationEngine {
    handle: ConsensusHandle,
}

impl LeaderRotationEngine {
    pub fn new(handle: ConsensusHandle) -> Self {
        LeaderRotationEngine { handle }
    }

    /// Evaluate the transition rule once.
    ///
    /// A node that missed several deadlines moves one leader per call and
    /// re-evaluates on the next tick.
    pub fn tick(&self, now_ms: u64) -> ConsensusResult<RotationOutcome> {
        self.handle.update(|state| {
            let timeframe = state.approvement.network_parameters.leadership_timeframe()?;
            let epoch = &state.approvement.epoch;
            let index = epoch.current_leader_index;
            let skipped_leader = epoch.leader_at(index)?.to_string();

            if now_ms < epoch.leader_deadline(index, timeframe) {
                return Ok(RotationOutcome::Idle);
            }

            if !epoch.has_next_candidate() {
                return if state.approvement.is_epoch_active(now_ms)? {
                    Ok(RotationOutcome::Idle)
                } else {
                    Ok(RotationOutcome::EpochExhausted { epoch_id: epoch.id })
                };
            }

            let epoch_id = epoch.id;
            let request = skip_request(state, &skipped_leader);

            state.aggregator.open(
                ProofId::LeaderRotation {
                    epoch_id,
                    leader_index: index,
                },
                ProofBody::LeaderRotation {
                    skipped_leader: skipped_leader.clone(),
                    proof: request.clone(),
                },
            )?;
            state.approvement.epoch.current_leader_index = index + 1;

            info!(
                "Epoch {}: leader {} ({}) timed out, rotating to index {}",
                epoch_id,
                index,
                skipped_leader,
                index + 1
            );
            Ok(RotationOutcome::Rotated {
                epoch_id,
                from_index: index,
                to_index: index + 1,
                skipped_leader,
                request,
            })
        })
    }

    /// Whether this node may sign a request to skip the leader at `leader_index`.
    ///
    /// Requests that arrive before the local deadline are refused and logged.
    /// The sender is not penalized.
    pub fn may_attest_rotation(&self, now_ms: u64, leader_index: usize) -> ConsensusResult<bool> {
        self.handle
            .read(|state| rotation_deadline_passed(state, now_ms, leader_index))
    }

    /// Follow an aggregated rotation proof produced by the quorum.
    ///
    /// Advances at most one step, whatever the local clock says. Returns
    /// `true` when the local index moved.
    pub fn adopt_rotation(&self, epoch_id: u64, leader_index: usize) -> bool {
        self.handle.update(|state| {
            let epoch = &mut state.approvement.epoch;
            if epoch.id != epoch_id {
                debug!(
                    "Ignoring rotation proof for epoch {} while on epoch {}",
                    epoch_id, epoch.id
                );
                return false;
            }
            if leader_index < epoch.current_leader_index {
                return false;
            }
            if epoch.current_leader_index + 1 >= epoch.leaders_sequence.len() {
                return false;
            }
            if leader_index > epoch.current_leader_index {
                warn!(
                    "Epoch {}: quorum rotated past leader {} while local index is {}",
                    epoch_id, leader_index, epoch.current_leader_index
                );
            }
            epoch.current_leader_index += 1;
            true
        })
    }

    /// Catch up with `leader`, whose first block carries the rotation proofs
    /// of the leaders before it.
    ///
    /// The chain is validated first. The index then moves one leader per
    /// step, recording each presented link as a finalized rotation proof.
    /// Returns the number of steps taken.
    pub fn adopt_rotation_chain(
        &self,
        epoch_id: u64,
        leader: &str,
        proofs: &BTreeMap<usize, LeaderRotationProof>,
        verifier: &dyn SignatureVerifier,
    ) -> ConsensusResult<usize> {
        self.handle.update(|state| {
            let epoch = &state.approvement.epoch;
            if epoch.id != epoch_id {
                return Ok(0);
            }
            let position = match epoch.leader_position(leader) {
                Some(position) if position > epoch.current_leader_index => position,
                _ => return Ok(0),
            };
            if !validate_rotation_chain(epoch, position, proofs, verifier)? {
                debug!(
                    "Epoch {}: rotation chain presented by {} does not validate",
                    epoch_id, leader
                );
                return Ok(0);
            }

            let mut steps = 0;
            while state.approvement.epoch.current_leader_index < position {
                let index = state.approvement.epoch.current_leader_index;
                if let Some(proof) = proofs.get(&index) {
                    let body = ProofBody::LeaderRotation {
                        skipped_leader: state.approvement.epoch.leader_at(index)?.to_string(),
                        proof: proof.clone(),
                    };
                    let key = ProofId::LeaderRotation {
                        epoch_id,
                        leader_index: index,
                    }
                    .to_string();
                    if !state.approvement.cache.contains_key(&key) {
                        state.approvement.cache.insert(key, serde_json::to_value(&body)?);
                    }
                }
                state.approvement.epoch.current_leader_index = index + 1;
                steps += 1;
            }
            info!(
                "Epoch {}: followed rotation chain of {} to leader index {} ({} steps)",
                epoch_id, leader, position, steps
            );
            Ok(steps)
        })
    }
}

/// The rotation statement this node would sign for skipping `skipped_leader`,
/// built from the blocks it has seen from that leader.
fn skip_request(state: &ConsensusState, skipped_leader: &str) -> LeaderRotationProof {
    match state.leader_tips.get(skipped_leader) {
        Some(tip) => LeaderRotationProof {
            first_block_hash: tip.first_block_hash.clone(),
            skip_index: tip.last_index,
            skip_hash: tip.last_hash.clone(),
            ..LeaderRotationProof::default()
        },
        None => LeaderRotationProof::default(),
    }
}

/// Locally derived statement for skipping the leader at `leader_index`.
pub fn rotation_statement(state: &ConsensusState, leader_index: usize) -> ConsensusResult<ProofBody> {
    let skipped_leader = state.approvement.epoch.leader_at(leader_index)?.to_string();
    Ok(ProofBody::LeaderRotation {
        proof: skip_request(state, &skipped_leader),
        skipped_leader,
    })
}

/// Whether the local deadline of the leader at `leader_index` has passed.
///
/// Requests that arrive earlier are refused and logged. The sender is not penalized.
pub fn rotation_deadline_passed(
    state: &ConsensusState,
    now_ms: u64,
    leader_index: usize,
) -> ConsensusResult<bool> {
    let timeframe = state.approvement.network_parameters.leadership_timeframe()?;
    let deadline = state
        .approvement
        .epoch
        .leader_deadline(leader_index, timeframe);
    if now_ms < deadline {
        debug!(
            "Early rotation request for leader index {} ({} ms before local deadline)",
            leader_index,
            deadline - now_ms
        );
        return Ok(false);
    }
    Ok(true)
}

/// Check the rotation proofs a leader at `position` presents with its first block.
///
/// `proofs` is keyed by the index of the skipped leader. The chain must cover
/// every earlier leader back to index 0 or to one that produced at least one
/// block, and each link must carry a quorum majority for `epoch`.
pub fn validate_rotation_chain(
    epoch: &EpochRecord,
    position: usize,
    proofs: &BTreeMap<usize, LeaderRotationProof>,
    verifier: &dyn SignatureVerifier,
) -> ConsensusResult<bool> {
    let full_id = epoch.full_id();
    let majority = epoch.quorum_majority();

    for index in (0..position).rev() {
        let skipped = epoch.leader_at(index)?;
        let proof = match proofs.get(&index) {
            Some(proof) => proof,
            None => {
                debug!("Rotation chain has no proof for leader index {}", index);
                return Ok(false);
            }
        };
        let payload = proof.signing_payload(skipped, &full_id);
        if count_quorum_signatures(&payload, &proof.signatures, &epoch.quorum, verifier) < majority {
            return Ok(false);
        }
        if proof.produced_blocks() {
            break;
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use protochain_core::params::{EPOCH_TIME, LEADERSHIP_TIMEFRAME};
    use protochain_core::{
        ApprovementThread, ConsensusError, Ed25519Signer, Ed25519Verifier, GenerationThread,
        MessageSigner, NetworkParameters,
    };

    fn epoch_with(leaders: Vec<String>) -> EpochRecord {
        EpochRecord {
            id: 0,
            hash: "h".into(),
            pools_registry: BTreeMap::new(),
            quorum: leaders.clone(),
            leaders_sequence: leaders,
            start_timestamp: 0,
            current_leader_index: 0,
        }
    }

    fn engine_with(params: NetworkParameters) -> LeaderRotationEngine {
        let approvement = ApprovementThread {
            core_major_version: 1,
            network_parameters: params,
            epoch: epoch_with(vec!["A".into(), "B".into(), "C".into()]),
            cache: BTreeMap::new(),
        };
        let state = ConsensusState::new(approvement, GenerationThread::genesis("devnet"));
        LeaderRotationEngine::new(ConsensusHandle::new(state))
    }

    fn engine() -> LeaderRotationEngine {
        engine_with(
            NetworkParameters::new()
                .with(EPOCH_TIME, 10_000u64)
                .with(LEADERSHIP_TIMEFRAME, 1_000u64),
        )
    }

    fn index(engine: &LeaderRotationEngine) -> usize {
        engine
            .handle
            .read(|state| state.approvement.epoch.current_leader_index)
    }

    #[test]
    fn test_rotation_at_1500_reaches_index_one() {
        let engine = engine();
        assert_eq!(engine.tick(500).unwrap(), RotationOutcome::Idle);

        let outcome = engine.tick(1_500).unwrap();
        assert!(matches!(
            outcome,
            RotationOutcome::Rotated {
                from_index: 0,
                to_index: 1,
                ..
            }
        ));
        assert_eq!(engine.tick(1_500).unwrap(), RotationOutcome::Idle);
        assert_eq!(index(&engine), 1);
    }

    #[test]
    fn test_one_step_per_tick_when_behind() {
        let engine = engine();
        engine.tick(2_500).unwrap();
        assert_eq!(index(&engine), 1);
        engine.tick(2_500).unwrap();
        assert_eq!(index(&engine), 2);
    }

    #[test]
    fn test_rotation_saturates_at_last_leader() {
        let engine = engine();
        for _ in 0..10 {
            engine.tick(5_000).unwrap();
        }
        assert_eq!(index(&engine), 2);
        assert_eq!(engine.tick(5_000).unwrap(), RotationOutcome::Idle);
        assert_eq!(
            engine.tick(u64::MAX).unwrap(),
            RotationOutcome::EpochExhausted { epoch_id: 0 }
        );
        assert_eq!(index(&engine), 2);
    }

    #[test]
    fn test_missing_timeframe_is_fatal() {
        let engine = engine_with(NetworkParameters::new().with(EPOCH_TIME, 10_000u64));
        let err = engine.tick(1_500).unwrap_err();
        assert!(matches!(err, ConsensusError::Configuration(_)));
        assert!(err.is_fatal());
        assert_eq!(index(&engine), 0);
    }

    #[test]
    fn test_rotation_opens_request_with_skip_data() {
        let engine = engine();
        engine.handle.update(|state| {
            state.observe_block("A", 0, "a0");
            state.observe_block("A", 1, "a1");
        });
        match engine.tick(1_000).unwrap() {
            RotationOutcome::Rotated {
                skipped_leader,
                request,
                ..
            } => {
                assert_eq!(skipped_leader, "A");
                assert_eq!(request.first_block_hash, "a0");
                assert_eq!(request.skip_index, 1);
                assert_eq!(request.skip_hash, "a1");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(engine.handle.read(|state| state.aggregator.is_open(&ProofId::LeaderRotation {
            epoch_id: 0,
            leader_index: 0
        })));
    }

    #[test]
    fn test_may_attest_rotation_waits_for_local_deadline() {
        let engine = engine();
        assert!(!engine.may_attest_rotation(999, 0).unwrap());
        assert!(engine.may_attest_rotation(1_000, 0).unwrap());
        assert!(!engine.may_attest_rotation(1_000, 1).unwrap());
    }

    #[test]
    fn test_adopt_rotation_moves_one_step() {
        let engine = engine();
        assert!(engine.adopt_rotation(0, 0));
        assert_eq!(index(&engine), 1);
        // Stale proof for an already skipped leader.
        assert!(!engine.adopt_rotation(0, 0));
        // Proof from further ahead still moves a single step.
        assert!(engine.adopt_rotation(0, 5));
        assert_eq!(index(&engine), 2);
        assert!(!engine.adopt_rotation(0, 2));
        assert!(!engine.adopt_rotation(7, 2));
    }

    fn signed(
        signers: &[Ed25519Signer],
        skipped: &str,
        skip_index: i64,
        full_id: &str,
    ) -> LeaderRotationProof {
        let mut proof = LeaderRotationProof {
            first_block_hash: if skip_index >= 0 { "first".into() } else { String::new() },
            skip_index,
            skip_hash: if skip_index >= 0 { "last".into() } else { String::new() },
            ..LeaderRotationProof::default()
        };
        let payload = proof.signing_payload(skipped, full_id);
        for signer in signers {
            proof
                .signatures
                .insert(signer.public_key().to_string(), signer.sign(&payload));
        }
        proof
    }

    #[test]
    fn test_rotation_chain_validity() {
        let signers: Vec<Ed25519Signer> = (1..=3u8).map(|b| Ed25519Signer::from_seed([b; 32])).collect();
        let keys: Vec<String> = signers.iter().map(|s| s.public_key().to_string()).collect();
        let epoch = epoch_with(keys.clone());
        let full_id = epoch.full_id();
        let verifier = Ed25519Verifier;

        // Leader 0 produced blocks, leader 1 did not: leader 2 needs proofs for 1 and 0.
        let mut proofs = BTreeMap::new();
        proofs.insert(1, signed(&signers, &keys[1], -1, &full_id));
        assert!(!validate_rotation_chain(&epoch, 2, &proofs, &verifier).unwrap());

        proofs.insert(0, signed(&signers, &keys[0], 3, &full_id));
        assert!(validate_rotation_chain(&epoch, 2, &proofs, &verifier).unwrap());

        // A link that stops at a productive leader does not need older proofs.
        let mut short = BTreeMap::new();
        short.insert(1, signed(&signers, &keys[1], 0, &full_id));
        assert!(validate_rotation_chain(&epoch, 2, &short, &verifier).unwrap());

        // Two of three signatures is below majority for a quorum of three.
        let mut weak = BTreeMap::new();
        weak.insert(0, signed(&signers[..2], &keys[0], 3, &full_id));
        assert!(!validate_rotation_chain(&epoch, 1, &weak, &verifier).unwrap());

        assert!(validate_rotation_chain(&epoch, 0, &BTreeMap::new(), &verifier).unwrap());
    }

    #[test]
    fn test_adopt_rotation_chain_steps_through_each_link() {
        let signers: Vec<Ed25519Signer> = (1..=3u8).map(|b| Ed25519Signer::from_seed([b; 32])).collect();
        let keys: Vec<String> = signers.iter().map(|s| s.public_key().to_string()).collect();
        let approvement = ApprovementThread {
            core_major_version: 1,
            network_parameters: NetworkParameters::new()
                .with(EPOCH_TIME, 10_000u64)
                .with(LEADERSHIP_TIMEFRAME, 1_000u64),
            epoch: epoch_with(keys.clone()),
            cache: BTreeMap::new(),
        };
        let full_id = approvement.epoch.full_id();
        let engine = LeaderRotationEngine::new(ConsensusHandle::new(ConsensusState::new(
            approvement,
            GenerationThread::genesis("devnet"),
        )));
        let verifier = Ed25519Verifier;

        // Missing link for leader 0: nothing moves.
        let mut proofs = BTreeMap::new();
        proofs.insert(1, signed(&signers, &keys[1], -1, &full_id));
        assert_eq!(engine.adopt_rotation_chain(0, &keys[2], &proofs, &verifier).unwrap(), 0);
        assert_eq!(index(&engine), 0);

        proofs.insert(0, signed(&signers, &keys[0], -1, &full_id));
        assert_eq!(engine.adopt_rotation_chain(0, &keys[2], &proofs, &verifier).unwrap(), 2);
        assert_eq!(index(&engine), 2);
        engine.handle.read(|state| {
            assert!(state.approvement.cache.contains_key("ALRP:0:0"));
            assert!(state.approvement.cache.contains_key("ALRP:0:1"));
        });

        // Already there, and wrong epoch: no-ops.
        assert_eq!(engine.adopt_rotation_chain(0, &keys[2], &proofs, &verifier).unwrap(), 0);
        assert_eq!(engine.adopt_rotation_chain(3, &keys[2], &proofs, &verifier).unwrap(), 0);
    }

    #[test]
    fn test_rotation_statement_matches_tick_request() {
        let engine = engine();
        engine.handle.update(|state| state.observe_block("A", 0, "a0"));
        let expected = engine
            .handle
            .read(|state| rotation_statement(state, 0))
            .unwrap();
        match engine.tick(1_000).unwrap() {
            RotationOutcome::Rotated {
                skipped_leader,
                request,
                ..
            } => assert_eq!(
                expected,
                ProofBody::LeaderRotation {
                    skipped_leader,
                    proof: request
                }
            ),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    proptest! {
        #[test]
        fn prop_index_never_decreases(mut times in proptest::collection::vec(0u64..20_000, 1..40)) {
            times.sort_unstable();
            let engine = engine();
            let mut last = 0;
            for now in times {
                engine.tick(now).unwrap();
                let current = index(&engine);
                prop_assert!(current >= last);
                prop_assert!(current <= last + 1);
                prop_assert!(current <= 2);
                last = current;
            }
        }
    }
}
