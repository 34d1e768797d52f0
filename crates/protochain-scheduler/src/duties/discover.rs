// DISCOVER-EPOCH DUTY
// Closes an expired epoch with a quorum-signed finalization proof and moves to its successor.
//
// SAFETY INVARIANTS:
// 1. The successor epoch is only installed once the epoch finalization proof is final
// 2. The transition is persisted before the next tick
// 3. Every node derives the same successor from the same finished epoch

use crate::context::{cache_if_final, DutyContext};
use crate::duty::Duty;
use crate::error::SchedulerResult;
use async_trait::async_trait;
use protochain_consensus::{ProofBody, ProofId};
use protochain_core::ConsensusError;
use protochain_p2p::PeerMessage;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct DiscoverEpochDuty {
    ctx: Arc<DutyContext>,
}

impl DiscoverEpochDuty {
    pub fn new(ctx: Arc<DutyContext>) -> Self {
        DiscoverEpochDuty { ctx }
    }
}

#[async_trait]
impl Duty for DiscoverEpochDuty {
    fn name(&self) -> &'static str {
        "discover-epoch"
    }

    fn interval(&self) -> Duration {
        self.ctx.settings.discover_interval()
    }

    async fn tick(&self) -> SchedulerResult<()> {
        let ctx = &self.ctx;
        if ctx.epochs.is_active(ctx.now())? {
            return Ok(());
        }

        let epoch_id = ctx.epochs.epoch().id;
        let id = ProofId::Epoch(epoch_id);

        let opened = if ctx.handle.read(|state| state.aggregator.is_open(&id)) {
            None
        } else {
            let statement = ctx.epochs.epoch_finalization_statement()?;
            let body = ProofBody::Epoch(statement);
            let signature = ctx.handle.update(|state| {
                state.aggregator.open(id.clone(), body.clone())?;
                let signature = ctx.sign_own(state, &id)?;
                cache_if_final(state, &id)?;
                Ok::<_, ConsensusError>(signature)
            })?;
            info!(epoch_id, "Epoch expired, requesting finalization");
            Some((body, signature))
        };

        if let Some((body, signature)) = opened {
            ctx.broadcast(PeerMessage::SignatureRequest {
                id: id.clone(),
                body,
            })
            .await?;
            if let Some(signature) = signature {
                ctx.broadcast(PeerMessage::SignatureShare {
                    id: id.clone(),
                    signature,
                })
                .await?;
            }
        }

        let aggregate = ctx
            .handle
            .read(|state| state.aggregator.build_aggregate(&id));
        match aggregate {
            Ok(ProofBody::Epoch(proof)) => {
                ctx.broadcast(PeerMessage::EpochFinalizationProof { epoch_id, proof })
                    .await?;
                advance_epoch(ctx, epoch_id)
            }
            Ok(_) => Ok(()),
            Err(ConsensusError::ProofNotFinal(_)) => {
                debug!(epoch_id, "Epoch finalization still pending");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Install the successor of `epoch_id` if it is still the active epoch.
pub(crate) fn advance_epoch(ctx: &DutyContext, epoch_id: u64) -> SchedulerResult<()> {
    if ctx.epochs.epoch().id != epoch_id {
        return Ok(());
    }
    let next = ctx.epochs.propose_next_epoch()?;
    match ctx.epochs.replace_epoch(next) {
        Ok(()) => {}
        // Another duty installed the successor first.
        Err(ConsensusError::InvalidEpochTransition(_)) => return Ok(()),
        Err(err) => return Err(err.into()),
    }
    ctx.persist()
}
