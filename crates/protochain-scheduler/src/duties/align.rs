use crate::context::DutyContext;
use crate::duty::Duty;
use crate::error::SchedulerResult;
use async_trait::async_trait;
use protochain_p2p::{PeerMessage, ValidatorState};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Announces this node's view of consensus and reports where peers disagree.
pub struct AlignVerificationDuty {
    ctx: Arc<DutyContext>,
}

impl AlignVerificationDuty {
    pub fn new(ctx: Arc<DutyContext>) -> Self {
        AlignVerificationDuty { ctx }
    }

    pub fn local_state(&self) -> ValidatorState {
        self.ctx.handle.read(|state| ValidatorState {
            epoch_id: state.approvement.epoch.id,
            epoch_full_id: state.approvement.epoch.full_id(),
            current_leader_index: state.approvement.epoch.current_leader_index,
            generation_index: state.generation.last_index(),
            core_major_version: state.approvement.core_major_version,
        })
    }

    /// Compare collected peer reports with the local view. Returns the number of divergences.
    pub fn compare_peers(&self) -> usize {
        let local = self.local_state();
        let tolerance = self.ctx.settings.clock_skew_tolerance_ms as i64;
        let views: Vec<_> = self.ctx.peer_views.lock().drain().collect();

        let mut divergences = 0;
        for (peer, view) in views {
            if let Some(skew) = view.clock_skew_ms {
                if skew.abs() > tolerance {
                    warn!(%peer, skew_ms = skew, "Peer clock skew above tolerance");
                    divergences += 1;
                }
            }
            let state = match view.state {
                Some(state) => state,
                None => continue,
            };
            if state.core_major_version > local.core_major_version {
                warn!(%peer, peer_version = state.core_major_version, "Peer runs a newer core");
                divergences += 1;
            }
            if state.epoch_id > local.epoch_id {
                warn!(%peer, peer_epoch = state.epoch_id, local_epoch = local.epoch_id, "Peer is on a later epoch");
                divergences += 1;
            } else if state.epoch_id == local.epoch_id {
                if state.epoch_full_id != local.epoch_full_id {
                    warn!(%peer, peer_epoch = %state.epoch_full_id, local_epoch = %local.epoch_full_id, "Peer disagrees on the epoch record");
                    divergences += 1;
                } else if state.current_leader_index > local.current_leader_index {
                    info!(
                        %peer,
                        peer_index = state.current_leader_index,
                        local_index = local.current_leader_index,
                        "Peer leader index ahead"
                    );
                    divergences += 1;
                }
            } else {
                debug!(%peer, peer_epoch = state.epoch_id, "Peer is catching up");
            }
        }
        divergences
    }
}

#[async_trait]
impl Duty for AlignVerificationDuty {
    fn name(&self) -> &'static str {
        "align-verification"
    }

    fn interval(&self) -> Duration {
        self.ctx.settings.align_interval()
    }

    async fn tick(&self) -> SchedulerResult<()> {
        let ctx = &self.ctx;
        if let Err(err) = ctx.epochs.check_version() {
            debug!(error = %err, "Finalization disabled");
        }

        let divergences = self.compare_peers();
        if divergences > 0 {
            debug!(divergences, "Peer state comparison finished");
        }

        ctx.broadcast(PeerMessage::ValidatorState(self.local_state()))
            .await?;
        ctx.broadcast(PeerMessage::SyncTimestamp {
            timestamp: ctx.now(),
        })
        .await
    }
}
