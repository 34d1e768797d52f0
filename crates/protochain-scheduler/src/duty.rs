use crate::error::SchedulerResult;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, warn};

/// One recurring piece of consensus work.
#[async_trait]
pub trait Duty: Send + Sync {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    async fn tick(&self) -> SchedulerResult<()>;
}

/// Drive a duty until shutdown is signalled or it hits a fatal error.
///
/// Recoverable errors are logged and the next tick runs as usual.
pub async fn run_duty(duty: Arc<dyn Duty>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = time::interval(duty.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                match duty.tick().await {
                    Ok(()) => {}
                    Err(err) if err.is_fatal() => {
                        error!(duty = duty.name(), error = %err, "Duty stopped; operator action required");
                        return;
                    }
                    Err(err) => {
                        warn!(duty = duty.name(), error = %err, "Duty tick failed");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!(duty = duty.name(), "Duty exited");
}
