// SHARE/GATHER-PROOFS DUTY
// Drains inbound peer messages and feeds them into consensus state.
//
// SAFETY INVARIANTS:
// 1. Every message kind is handled explicitly; nothing is dispatched by type code
// 2. A bad message is rejected on its own and never aborts the drain
// 3. This node signs only statements it derived itself: blocks it accepted from the
//    current leader, rotations past the local deadline, expired epochs; requests
//    from outside the quorum are ignored
// 4. Aggregated proofs are checked against the quorum of the epoch they claim

use crate::context::{cache_if_final, DutyContext};
use crate::duties::discover::advance_epoch;
use crate::duty::Duty;
use crate::error::{SchedulerError, SchedulerResult};
use async_trait::async_trait;
use protochain_consensus::{
    finalization_statement, rotation_deadline_passed, rotation_statement, ConsensusState, ProofBody,
    ProofId,
};
use protochain_core::{
    BlockHeader, ConsensusError, ConsensusResult, EpochFinalizationProof, FinalizationProof,
    LeaderRotationProof, ZERO_HASH,
};
use protochain_p2p::{Envelope, PeerMessage, TransportError, ValidatorState};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

pub struct GatherProofsDuty {
    ctx: Arc<DutyContext>,
}

impl GatherProofsDuty {
    pub fn new(ctx: Arc<DutyContext>) -> Self {
        GatherProofsDuty { ctx }
    }
}

#[async_trait]
impl Duty for GatherProofsDuty {
    fn name(&self) -> &'static str {
        "share-gather-proofs"
    }

    fn interval(&self) -> Duration {
        self.ctx.settings.gather_interval()
    }

    async fn tick(&self) -> SchedulerResult<()> {
        let ctx = &self.ctx;
        let deadline = Instant::now() + ctx.settings.network_timeout();

        for _ in 0..ctx.settings.max_inbound_per_tick {
            let envelope = match timeout_at(deadline, ctx.transport.recv()).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => return Err(TransportError::Closed.into()),
                Err(_) => break,
            };
            let sender = envelope.sender.clone();
            let kind = envelope.message.kind();
            if let Err(err) = handle_envelope(ctx, envelope).await {
                match err {
                    SchedulerError::Consensus(ConsensusError::UnknownEpoch(_))
                    | SchedulerError::Consensus(ConsensusError::UnknownProof(_)) => {
                        debug!(%sender, kind, error = %err, "Message rejected")
                    }
                    _ => warn!(%sender, kind, error = %err, "Message rejected"),
                }
            }
        }
        Ok(())
    }
}

pub(crate) async fn handle_envelope(ctx: &DutyContext, envelope: Envelope) -> SchedulerResult<()> {
    let Envelope { sender, message, .. } = envelope;

    match message {
        PeerMessage::ValidatorState(state) => {
            record_peer_state(ctx, &sender, state);
            Ok(())
        }
        PeerMessage::BlockAnnouncement {
            header,
            rotation_proofs,
        } => on_block(ctx, header, rotation_proofs).await,
        PeerMessage::SignatureRequest { id, body } => {
            on_signature_request(ctx, &sender, id, body).await
        }
        PeerMessage::SignatureShare { id, signature } => {
            on_signature_share(ctx, &sender, id, signature).await
        }
        PeerMessage::LeaderRotationProof {
            epoch_id,
            leader_index,
            skipped_leader,
            proof,
        } => on_rotation_proof(ctx, epoch_id, leader_index, skipped_leader, proof),
        PeerMessage::EpochFinalizationProof { epoch_id, proof } => {
            on_epoch_proof(ctx, epoch_id, proof)
        }
        PeerMessage::SyncTimestamp { timestamp: peer_now } => {
            let skew = peer_now as i64 - ctx.now() as i64;
            ctx.peer_views
                .lock()
                .entry(sender)
                .or_default()
                .clock_skew_ms = Some(skew);
            Ok(())
        }
    }
}

fn record_peer_state(ctx: &DutyContext, sender: &str, state: ValidatorState) {
    ctx.peer_views
        .lock()
        .entry(sender.to_string())
        .or_default()
        .state = Some(state);
}

/// Accept a block from the current leader, open its proof and sign it.
async fn on_block(
    ctx: &DutyContext,
    header: BlockHeader,
    rotation_proofs: BTreeMap<usize, LeaderRotationProof>,
) -> SchedulerResult<()> {
    if header.index == 0 && !rotation_proofs.is_empty() {
        let steps = ctx.rotation.adopt_rotation_chain(
            header.epoch_id,
            &header.creator,
            &rotation_proofs,
            ctx.verifier.as_ref(),
        )?;
        if steps > 0 {
            ctx.persist()?;
        }
    }

    let accepted = ctx
        .handle
        .update(|state| accept_block(ctx, state, &header))?;
    if let Some((id, signature)) = accepted {
        ctx.broadcast(PeerMessage::SignatureShare { id, signature })
            .await?;
    }
    Ok(())
}

fn accept_block(
    ctx: &DutyContext,
    state: &mut ConsensusState,
    header: &BlockHeader,
) -> ConsensusResult<Option<(ProofId, String)>> {
    let epoch = &state.approvement.epoch;
    if header.epoch_id != epoch.id || header.epoch_full_id != epoch.full_id() {
        if !state.aggregator.knows_epoch(header.epoch_id) {
            return Err(ConsensusError::UnknownEpoch(header.epoch_id));
        }
        debug!(block = %header.id(), "Block for an inactive epoch ignored");
        return Ok(None);
    }

    let position = match epoch.leader_position(&header.creator) {
        Some(position) => position,
        None => {
            return Err(ConsensusError::UnknownValidator {
                validator: header.creator.clone(),
                epoch_id: epoch.id,
            })
        }
    };
    if position < epoch.current_leader_index {
        debug!(block = %header.id(), "Block from an already rotated leader ignored");
        return Ok(None);
    }
    if position > epoch.current_leader_index {
        debug!(block = %header.id(), position, "Block from a future leader without a valid rotation chain");
        return Ok(None);
    }

    let expected_prev = match state.leader_tips.get(&header.creator) {
        Some(tip) if header.index as i64 == tip.last_index + 1 => Some(tip.last_hash.clone()),
        None if header.index == 0 => Some(ZERO_HASH.to_string()),
        _ => None,
    };
    if let Some(expected) = expected_prev {
        if header.prev_hash != expected {
            warn!(block = %header.id(), "Block does not extend the leader's chain");
            return Ok(None);
        }
    }

    let hash = header.hash();
    state.observe_block(&header.creator, header.index, &hash);
    let id = ProofId::Block {
        epoch_id: header.epoch_id,
        block_id: header.id(),
    };
    state.aggregator.open(
        id.clone(),
        ProofBody::Block(FinalizationProof::new(
            header.prev_hash.clone(),
            header.id(),
            hash,
        )),
    )?;
    let signature = ctx.sign_own(state, &id)?;
    cache_if_final(state, &id)?;
    Ok(signature.map(|signature| (id, signature)))
}

/// Sign a peer's statement when it is identical to the one this node derives itself.
async fn on_signature_request(
    ctx: &DutyContext,
    sender: &str,
    id: ProofId,
    body: ProofBody,
) -> SchedulerResult<()> {
    let now = ctx.now();
    let signature = ctx.handle.update(|state| {
        let epoch = &state.approvement.epoch;
        if id.epoch_id() != epoch.id {
            debug!(proof = %id, current_epoch = epoch.id, "Signature request for an inactive epoch ignored");
            return Ok(None);
        }
        if !epoch.is_quorum_member(sender) {
            debug!(proof = %id, %sender, "Signature request from outside the quorum ignored");
            return Ok(None);
        }
        let expected = match local_statement(state, &id, now)? {
            Some(expected) => expected,
            None => {
                debug!(proof = %id, "Signature request not justified locally");
                return Ok(None);
            }
        };
        if body.unsigned() != expected {
            warn!(proof = %id, %sender, "Signature request differs from the local statement");
            return Ok(None);
        }

        state.aggregator.open(id.clone(), expected)?;
        let signature = ctx.sign_own(state, &id)?;
        cache_if_final(state, &id)?;
        Ok::<_, ConsensusError>(signature)
    })?;
    if let Some(signature) = signature {
        ctx.broadcast(PeerMessage::SignatureShare { id, signature })
            .await?;
    }
    Ok(())
}

/// The statement this node would sign under `id`, if any.
///
/// Blocks are signed only once accepted from the leader. Rotations and epoch
/// closings are rebuilt from local observations once their deadline passed.
fn local_statement(state: &ConsensusState, id: &ProofId, now: u64) -> ConsensusResult<Option<ProofBody>> {
    match id {
        ProofId::Block { .. } => Ok(state.aggregator.statement(id)),
        ProofId::LeaderRotation { leader_index, .. } => {
            if !rotation_deadline_passed(state, now, *leader_index)? {
                return Ok(None);
            }
            match state.aggregator.statement(id) {
                Some(opened) => Ok(Some(opened)),
                None => rotation_statement(state, *leader_index).map(Some),
            }
        }
        ProofId::Epoch(_) => {
            if state.approvement.is_epoch_active(now)? {
                return Ok(None);
            }
            match state.aggregator.statement(id) {
                Some(opened) => Ok(Some(opened)),
                None => Ok(Some(ProofBody::Epoch(finalization_statement(state)?))),
            }
        }
    }
}

async fn on_signature_share(
    ctx: &DutyContext,
    sender: &str,
    id: ProofId,
    signature: String,
) -> SchedulerResult<()> {
    let finalized = ctx.handle.update(|state| {
        if !state.aggregator.is_open(&id) {
            return Ok(None);
        }
        state
            .aggregator
            .submit_verified(&id, sender, &signature, ctx.verifier.as_ref())?;
        cache_if_final(state, &id)
    })?;

    match (id, finalized) {
        (
            ProofId::LeaderRotation {
                epoch_id,
                leader_index,
            },
            Some(ProofBody::LeaderRotation {
                skipped_leader,
                proof,
            }),
        ) => {
            ctx.rotation.adopt_rotation(epoch_id, leader_index);
            ctx.persist()?;
            ctx.broadcast(PeerMessage::LeaderRotationProof {
                epoch_id,
                leader_index,
                skipped_leader,
                proof,
            })
            .await
        }
        (ProofId::Block { block_id, .. }, Some(_)) => {
            info!(block = %block_id, "Block finalized");
            Ok(())
        }
        _ => Ok(()),
    }
}

fn on_rotation_proof(
    ctx: &DutyContext,
    epoch_id: u64,
    leader_index: usize,
    skipped_leader: String,
    proof: LeaderRotationProof,
) -> SchedulerResult<()> {
    let id = ProofId::LeaderRotation {
        epoch_id,
        leader_index,
    };
    let body = ProofBody::LeaderRotation {
        skipped_leader,
        proof,
    };
    let valid = ctx.handle.update(|state| {
        if !state
            .aggregator
            .validate_incoming(epoch_id, &body, ctx.verifier.as_ref())?
        {
            return Ok(false);
        }
        state
            .approvement
            .cache
            .entry(id.to_string())
            .or_insert(serde_json::to_value(&body)?);
        Ok::<_, ConsensusError>(true)
    })?;
    if !valid {
        debug!(proof = %id, "Rotation proof below majority ignored");
        return Ok(());
    }
    if ctx.rotation.adopt_rotation(epoch_id, leader_index) {
        ctx.persist()?;
    }
    Ok(())
}

fn on_epoch_proof(ctx: &DutyContext, epoch_id: u64, proof: EpochFinalizationProof) -> SchedulerResult<()> {
    let body = ProofBody::Epoch(proof);
    let valid = ctx
        .handle
        .read(|state| state.aggregator.validate_incoming(epoch_id, &body, ctx.verifier.as_ref()))?;
    if !valid {
        debug!(epoch_id, "Epoch finalization proof below majority ignored");
        return Ok(());
    }
    advance_epoch(ctx, epoch_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SchedulerSettings;
    use protochain_consensus::ConsensusHandle;
    use protochain_core::params::{EPOCH_TIME, LEADERSHIP_TIMEFRAME};
    use protochain_core::{
        ApprovementThread, Clock, Ed25519Signer, Ed25519Verifier, EpochRecord, GenerationThread,
        ManualClock, MessageSigner, NetworkParameters, PoolRecord, CORE_MAJOR_VERSION,
    };
    use protochain_p2p::MemoryHub;
    use protochain_state::{MemoryStore, ThreadMetadataStore};

    const START: u64 = 1_000_000;

    struct Fixture {
        ctx: DutyContext,
        clock: Arc<ManualClock>,
        signers: Vec<Ed25519Signer>,
        keys: Vec<String>,
    }

    /// Three validators; this node is `keys[0]` and leads second.
    fn fixture() -> Fixture {
        let signers: Vec<Ed25519Signer> = (1..=3u8)
            .map(|seed| Ed25519Signer::from_seed([seed; 32]))
            .collect();
        let keys: Vec<String> = signers.iter().map(|s| s.public_key().to_string()).collect();
        let pools = keys
            .iter()
            .map(|key| {
                (
                    key.clone(),
                    PoolRecord {
                        total_stake: 10,
                        url: String::new(),
                    },
                )
            })
            .collect();
        let approvement = ApprovementThread {
            core_major_version: CORE_MAJOR_VERSION,
            network_parameters: NetworkParameters::new()
                .with(EPOCH_TIME, 60_000u64)
                .with(LEADERSHIP_TIMEFRAME, 10_000u64),
            epoch: EpochRecord {
                id: 0,
                hash: "gather".into(),
                pools_registry: pools,
                quorum: keys.clone(),
                leaders_sequence: vec![keys[1].clone(), keys[0].clone(), keys[2].clone()],
                start_timestamp: START,
                current_leader_index: 0,
            },
            cache: BTreeMap::new(),
        };
        let state = ConsensusState::new(approvement, GenerationThread::genesis("gather"));

        let hub = MemoryHub::new();
        let clock = Arc::new(ManualClock::new(START + 500));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let ctx = DutyContext::new(
            ConsensusHandle::new(state),
            Arc::new(ThreadMetadataStore::new(Arc::new(MemoryStore::new()))),
            Arc::new(hub.connect(&keys[0])),
            Arc::new(Ed25519Signer::from_seed([1u8; 32])),
            Arc::new(Ed25519Verifier),
            dyn_clock,
            SchedulerSettings::default(),
            CORE_MAJOR_VERSION,
        );
        Fixture {
            ctx,
            clock,
            signers,
            keys,
        }
    }

    impl Fixture {
        fn full_id(&self) -> String {
            self.ctx.epochs.epoch().full_id()
        }

        fn block(&self, creator: &str, index: u64, prev_hash: &str) -> BlockHeader {
            BlockHeader {
                creator: creator.to_string(),
                epoch_id: 0,
                epoch_full_id: self.full_id(),
                index,
                prev_hash: prev_hash.to_string(),
                timestamp: START + 600,
            }
        }

        async fn deliver(&self, sender: &str, message: PeerMessage) -> SchedulerResult<()> {
            handle_envelope(&self.ctx, Envelope::new(sender, START, message)).await
        }

        fn signature_count(&self, id: &ProofId) -> usize {
            self.ctx
                .handle
                .read(|state| state.aggregator.signature_count(id))
                .unwrap_or(0)
        }

        fn leader_index(&self) -> usize {
            self.ctx
                .handle
                .read(|state| state.approvement.epoch.current_leader_index)
        }

        fn signed_skip(&self, signers: &[Ed25519Signer], leader_index: usize) -> LeaderRotationProof {
            let skipped = self.ctx.epochs.epoch().leaders_sequence[leader_index].clone();
            let mut proof = LeaderRotationProof::default();
            let payload = proof.signing_payload(&skipped, &self.full_id());
            for signer in signers {
                proof
                    .signatures
                    .insert(signer.public_key().to_string(), signer.sign(&payload));
            }
            proof
        }
    }

    fn block_id(header: &BlockHeader) -> ProofId {
        ProofId::Block {
            epoch_id: header.epoch_id,
            block_id: header.id(),
        }
    }

    #[tokio::test]
    async fn test_block_request_is_signed_only_for_the_accepted_block() {
        let f = fixture();
        let header = f.block(&f.keys[1], 0, ZERO_HASH);
        let id = block_id(&header);
        let forged = ProofBody::Block(FinalizationProof::new(
            ZERO_HASH.to_string(),
            header.id(),
            "forged-hash".to_string(),
        ));
        let request = PeerMessage::SignatureRequest {
            id: id.clone(),
            body: forged,
        };

        // Outsider, then a quorum member before the block was seen.
        f.deliver("mallory", request.clone()).await.unwrap();
        f.deliver(&f.keys[2], request.clone()).await.unwrap();
        assert!(!f.ctx.handle.read(|state| state.aggregator.is_open(&id)));

        f.deliver(
            &f.keys[1],
            PeerMessage::BlockAnnouncement {
                header: header.clone(),
                rotation_proofs: BTreeMap::new(),
            },
        )
        .await
        .unwrap();
        assert_eq!(f.signature_count(&id), 1);

        // A differing statement under the same id stays refused.
        f.deliver(&f.keys[2], request).await.unwrap();
        let payload = f
            .ctx
            .handle
            .read(|state| state.aggregator.signing_payload(&id))
            .unwrap();
        assert!(payload.contains(&header.hash()));
        assert!(!payload.contains("forged-hash"));
        assert_eq!(f.signature_count(&id), 1);
    }

    #[tokio::test]
    async fn test_rotation_request_waits_for_deadline_and_matching_tips() {
        let f = fixture();
        let id = ProofId::LeaderRotation {
            epoch_id: 0,
            leader_index: 0,
        };
        let request = |proof: LeaderRotationProof| PeerMessage::SignatureRequest {
            id: id.clone(),
            body: ProofBody::LeaderRotation {
                skipped_leader: f.keys[1].clone(),
                proof,
            },
        };

        f.deliver(&f.keys[2], request(LeaderRotationProof::default()))
            .await
            .unwrap();
        assert!(!f.ctx.handle.read(|state| state.aggregator.is_open(&id)));

        f.clock.set(START + 10_000);
        let mismatched = LeaderRotationProof {
            skip_index: 4,
            skip_hash: "elsewhere".into(),
            ..LeaderRotationProof::default()
        };
        f.deliver(&f.keys[2], request(mismatched)).await.unwrap();
        assert!(!f.ctx.handle.read(|state| state.aggregator.is_open(&id)));

        f.deliver(&f.keys[2], request(LeaderRotationProof::default()))
            .await
            .unwrap();
        assert_eq!(f.signature_count(&id), 1);
    }

    #[tokio::test]
    async fn test_epoch_request_must_match_local_statement() {
        let f = fixture();
        f.clock.set(START + 60_000);
        let statement = f.ctx.epochs.epoch_finalization_statement().unwrap();
        let mut forged = statement.clone();
        forged.last_block_index = 9;
        forged.last_block_hash = "forged".into();

        f.deliver(
            &f.keys[2],
            PeerMessage::SignatureRequest {
                id: ProofId::Epoch(0),
                body: ProofBody::Epoch(forged),
            },
        )
        .await
        .unwrap();
        assert!(!f.ctx.handle.read(|state| state.aggregator.is_open(&ProofId::Epoch(0))));

        f.deliver(
            &f.keys[2],
            PeerMessage::SignatureRequest {
                id: ProofId::Epoch(0),
                body: ProofBody::Epoch(statement),
            },
        )
        .await
        .unwrap();
        assert_eq!(f.signature_count(&ProofId::Epoch(0)), 1);
    }

    #[tokio::test]
    async fn test_future_leader_block_needs_rotation_chain() {
        let f = fixture();
        let header = f.block(&f.keys[2], 0, ZERO_HASH);
        let announce = |proofs: BTreeMap<usize, LeaderRotationProof>| PeerMessage::BlockAnnouncement {
            header: header.clone(),
            rotation_proofs: proofs,
        };

        f.deliver(&f.keys[2], announce(BTreeMap::new())).await.unwrap();
        assert_eq!(f.leader_index(), 0);
        assert!(!f.ctx.handle.read(|state| state.aggregator.is_open(&block_id(&header))));

        // Two of three signatures per link is below majority.
        let weak: BTreeMap<usize, LeaderRotationProof> = (0..2)
            .map(|index| (index, f.signed_skip(&f.signers[..2], index)))
            .collect();
        f.deliver(&f.keys[2], announce(weak)).await.unwrap();
        assert_eq!(f.leader_index(), 0);

        let chain: BTreeMap<usize, LeaderRotationProof> = (0..2)
            .map(|index| (index, f.signed_skip(&f.signers, index)))
            .collect();
        f.deliver(&f.keys[2], announce(chain)).await.unwrap();
        assert_eq!(f.leader_index(), 2);
        assert_eq!(f.signature_count(&block_id(&header)), 1);
    }

    #[tokio::test]
    async fn test_epoch_proof_below_majority_is_ignored() {
        let f = fixture();
        let statement = f.ctx.epochs.epoch_finalization_statement().unwrap();
        let payload = statement.signing_payload(&f.full_id());
        let proof_signed_by = |signers: &[Ed25519Signer]| {
            let mut proof = statement.clone();
            for signer in signers {
                proof
                    .signatures
                    .insert(signer.public_key().to_string(), signer.sign(&payload));
            }
            PeerMessage::EpochFinalizationProof { epoch_id: 0, proof }
        };

        f.deliver(&f.keys[2], proof_signed_by(&f.signers[..2]))
            .await
            .unwrap();
        assert_eq!(f.ctx.epochs.epoch().id, 0);

        f.deliver(&f.keys[2], proof_signed_by(&f.signers)).await.unwrap();
        assert_eq!(f.ctx.epochs.epoch().id, 1);
    }

    #[tokio::test]
    async fn test_share_with_bad_signature_is_rejected() {
        let f = fixture();
        let header = f.block(&f.keys[1], 0, ZERO_HASH);
        let id = block_id(&header);
        f.deliver(
            &f.keys[1],
            PeerMessage::BlockAnnouncement {
                header,
                rotation_proofs: BTreeMap::new(),
            },
        )
        .await
        .unwrap();
        assert_eq!(f.signature_count(&id), 1);

        let err = f
            .deliver(
                &f.keys[2],
                PeerMessage::SignatureShare {
                    id: id.clone(),
                    signature: f.signers[2].sign("some other statement"),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Consensus(ConsensusError::InvalidSignature { .. })
        ));
        assert_eq!(f.signature_count(&id), 1);

        let payload = f
            .ctx
            .handle
            .read(|state| state.aggregator.signing_payload(&id))
            .unwrap();
        f.deliver(
            &f.keys[2],
            PeerMessage::SignatureShare {
                id: id.clone(),
                signature: f.signers[2].sign(&payload),
            },
        )
        .await
        .unwrap();
        assert_eq!(f.signature_count(&id), 2);
    }
}
