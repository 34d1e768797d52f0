// PROPOSE DUTY
// Produces the next block while this node holds leadership.
//
// SAFETY INVARIANTS:
// 1. Only the current leader of an active epoch proposes
// 2. The generation cursor is advanced and persisted before the block is announced
// 3. The first block of a leader carries the rotation proofs of the leaders it replaced

use crate::context::{cache_if_final, DutyContext};
use crate::duty::Duty;
use crate::error::SchedulerResult;
use async_trait::async_trait;
use protochain_consensus::{ConsensusState, ProofBody, ProofId};
use protochain_core::{BlockHeader, ConsensusResult, FinalizationProof, LeaderRotationProof};
use protochain_p2p::PeerMessage;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct ProposeDuty {
    ctx: Arc<DutyContext>,
}

impl ProposeDuty {
    pub fn new(ctx: Arc<DutyContext>) -> Self {
        ProposeDuty { ctx }
    }
}

/// Output of producing one block under the state lock.
struct Produced {
    header: BlockHeader,
    id: ProofId,
    signature: Option<String>,
    rotation_proofs: BTreeMap<usize, LeaderRotationProof>,
}

#[async_trait]
impl Duty for ProposeDuty {
    fn name(&self) -> &'static str {
        "propose"
    }

    fn interval(&self) -> Duration {
        self.ctx.settings.propose_interval()
    }

    async fn tick(&self) -> SchedulerResult<()> {
        let ctx = &self.ctx;
        let now = ctx.now();
        if !ctx.epochs.is_active(now)? || !ctx.handle.is_eligible_to_finalize() {
            return Ok(());
        }

        let produced = ctx.handle.update(|state| produce(ctx, state, now))?;
        let produced = match produced {
            Some(produced) => produced,
            None => return Ok(()),
        };

        let (_, generation) = ctx.handle.snapshot();
        ctx.metadata.save_generation_thread(&generation)?;

        info!(
            block = %produced.header.id(),
            hash = %produced.header.hash(),
            "Produced block"
        );
        ctx.broadcast(PeerMessage::BlockAnnouncement {
            header: produced.header,
            rotation_proofs: produced.rotation_proofs,
        })
        .await?;
        if let Some(signature) = produced.signature {
            ctx.broadcast(PeerMessage::SignatureShare {
                id: produced.id,
                signature,
            })
            .await?;
        }
        Ok(())
    }
}

fn produce(ctx: &DutyContext, state: &mut ConsensusState, now: u64) -> ConsensusResult<Option<Produced>> {
    let epoch = &state.approvement.epoch;
    if epoch.current_leader()? != ctx.local_key() {
        return Ok(None);
    }
    let epoch_id = epoch.id;
    let full_id = epoch.full_id();
    let position = epoch.current_leader_index;

    state.generation.enter_epoch(&full_id)?;
    let header = BlockHeader {
        creator: ctx.local_key().to_string(),
        epoch_id,
        epoch_full_id: full_id,
        index: state.generation.next_index,
        prev_hash: state.generation.prev_hash.clone(),
        timestamp: now,
    };
    let rotation_proofs = if header.index == 0 {
        collected_rotation_proofs(state, epoch_id, position)
    } else {
        BTreeMap::new()
    };

    let hash = header.hash();
    let block_id = header.id();
    state.generation.advance(&hash);
    state.observe_block(&header.creator, header.index, &hash);

    let id = ProofId::Block {
        epoch_id,
        block_id: block_id.clone(),
    };
    state.aggregator.open(
        id.clone(),
        ProofBody::Block(FinalizationProof::new(
            header.prev_hash.clone(),
            block_id,
            hash,
        )),
    )?;
    let signature = ctx.sign_own(state, &id)?;
    cache_if_final(state, &id)?;

    Ok(Some(Produced {
        header,
        id,
        signature,
        rotation_proofs,
    }))
}

/// Aggregated rotation proofs for the leaders before `position`, newest first,
/// stopping at the first leader that produced blocks.
fn collected_rotation_proofs(
    state: &ConsensusState,
    epoch_id: u64,
    position: usize,
) -> BTreeMap<usize, LeaderRotationProof> {
    let mut proofs = BTreeMap::new();
    for leader_index in (0..position).rev() {
        let key = ProofId::LeaderRotation {
            epoch_id,
            leader_index,
        }
        .to_string();
        let body = state
            .approvement
            .cache
            .get(&key)
            .and_then(|value| serde_json::from_value::<ProofBody>(value.clone()).ok());
        match body {
            Some(ProofBody::LeaderRotation { proof, .. }) => {
                let productive = proof.produced_blocks();
                proofs.insert(leader_index, proof);
                if productive {
                    break;
                }
            }
            _ => {
                warn!(leader_index, "No aggregated rotation proof on record for skipped leader");
                break;
            }
        }
    }
    if !proofs.is_empty() {
        debug!(count = proofs.len(), "Attaching rotation proofs to first block");
    }
    proofs
}
