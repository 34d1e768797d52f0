// CONSENSUS WORKER SCHEDULER
// Spawns every duty on its own timer and tears them down together.
//
// SAFETY INVARIANTS:
// 1. All duties share one shutdown signal and exit within one wake interval of it
// 2. A duty that stops on a fatal error leaves its siblings running
// 3. The checkpoint is written only after every duty has exited

use crate::context::DutyContext;
use crate::duties::{
    AlignVerificationDuty, DiscoverEpochDuty, GatherProofsDuty, ProposeDuty, RotateDuty,
};
use crate::duty::{run_duty, Duty};
use crate::error::SchedulerResult;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct ConsensusScheduler {
    ctx: Arc<DutyContext>,
    shutdown: watch::Sender<bool>,
    workers: Vec<(&'static str, JoinHandle<()>)>,
}

impl ConsensusScheduler {
    /// Spawn the standard duty set.
    pub fn start(ctx: Arc<DutyContext>) -> Self {
        let duties: Vec<Arc<dyn Duty>> = vec![
            Arc::new(ProposeDuty::new(ctx.clone())),
            Arc::new(RotateDuty::new(ctx.clone())),
            Arc::new(DiscoverEpochDuty::new(ctx.clone())),
            Arc::new(GatherProofsDuty::new(ctx.clone())),
            Arc::new(AlignVerificationDuty::new(ctx.clone())),
        ];
        Self::with_duties(ctx, duties)
    }

    pub fn with_duties(ctx: Arc<DutyContext>, duties: Vec<Arc<dyn Duty>>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let workers = duties
            .into_iter()
            .map(|duty| {
                let name = duty.name();
                (name, tokio::spawn(run_duty(duty, rx.clone())))
            })
            .collect::<Vec<_>>();
        info!(
            validator = %ctx.local_key(),
            duties = workers.len(),
            "Consensus scheduler started"
        );
        ConsensusScheduler {
            ctx,
            shutdown,
            workers,
        }
    }

    pub fn context(&self) -> &Arc<DutyContext> {
        &self.ctx
    }

    /// Names of the duties still running.
    pub fn running_duties(&self) -> Vec<&'static str> {
        self.workers
            .iter()
            .filter(|(_, worker)| !worker.is_finished())
            .map(|(name, _)| *name)
            .collect()
    }

    /// Signal every duty, wait for them and write the checkpoint.
    pub async fn shutdown(self) -> SchedulerResult<()> {
        let _ = self.shutdown.send(true);
        let (names, handles): (Vec<_>, Vec<_>) = self.workers.into_iter().unzip();
        for (name, result) in names.into_iter().zip(join_all(handles).await) {
            if let Err(err) = result {
                warn!(duty = name, error = %err, "Duty task ended abnormally");
            }
        }
        self.ctx.checkpoint()?;
        info!("Consensus scheduler stopped");
        Ok(())
    }
}
