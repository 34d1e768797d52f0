use crate::context::{cache_if_final, DutyContext};
use crate::duty::Duty;
use crate::error::SchedulerResult;
use async_trait::async_trait;
use protochain_consensus::{ProofBody, ProofId, RotationOutcome};
use protochain_core::ConsensusError;
use protochain_p2p::PeerMessage;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Runs the leader rotation engine and asks the quorum to attest each rotation.
pub struct RotateDuty {
    ctx: Arc<DutyContext>,
}

impl RotateDuty {
    pub fn new(ctx: Arc<DutyContext>) -> Self {
        RotateDuty { ctx }
    }
}

#[async_trait]
impl Duty for RotateDuty {
    fn name(&self) -> &'static str {
        "rotate"
    }

    fn interval(&self) -> Duration {
        self.ctx.settings.rotate_interval()
    }

    async fn tick(&self) -> SchedulerResult<()> {
        let ctx = &self.ctx;
        match ctx.rotation.tick(ctx.now())? {
            RotationOutcome::Idle => Ok(()),
            RotationOutcome::EpochExhausted { epoch_id } => {
                debug!(epoch_id, "Leaders sequence exhausted, waiting for epoch discovery");
                Ok(())
            }
            RotationOutcome::Rotated {
                epoch_id,
                from_index,
                skipped_leader,
                request,
                ..
            } => {
                let id = ProofId::LeaderRotation {
                    epoch_id,
                    leader_index: from_index,
                };
                let signature = ctx.handle.update(|state| {
                    let signature = ctx.sign_own(state, &id)?;
                    cache_if_final(state, &id)?;
                    Ok::<_, ConsensusError>(signature)
                })?;
                ctx.persist()?;

                ctx.broadcast(PeerMessage::SignatureRequest {
                    id: id.clone(),
                    body: ProofBody::LeaderRotation {
                        skipped_leader,
                        proof: request,
                    },
                })
                .await?;
                if let Some(signature) = signature {
                    ctx.broadcast(PeerMessage::SignatureShare { id, signature })
                        .await?;
                }
                Ok(())
            }
        }
    }
}
