// Wake intervals and network bounds of the duties.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub propose_interval_ms: u64,
    pub rotate_interval_ms: u64,
    pub discover_interval_ms: u64,
    pub gather_interval_ms: u64,
    pub align_interval_ms: u64,
    /// Upper bound for one broadcast and for one inbound drain.
    pub network_timeout_ms: u64,
    /// Peer clocks further apart than this are reported.
    pub clock_skew_tolerance_ms: u64,
    pub max_inbound_per_tick: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            propose_interval_ms: 1_000,
            rotate_interval_ms: 200,
            discover_interval_ms: 1_000,
            gather_interval_ms: 50,
            align_interval_ms: 5_000,
            network_timeout_ms: 500,
            clock_skew_tolerance_ms: 2_000,
            max_inbound_per_tick: 256,
        }
    }
}

impl SchedulerSettings {
    pub fn propose_interval(&self) -> Duration {
        Duration::from_millis(self.propose_interval_ms)
    }

    pub fn rotate_interval(&self) -> Duration {
        Duration::from_millis(self.rotate_interval_ms)
    }

    pub fn discover_interval(&self) -> Duration {
        Duration::from_millis(self.discover_interval_ms)
    }

    pub fn gather_interval(&self) -> Duration {
        Duration::from_millis(self.gather_interval_ms)
    }

    pub fn align_interval(&self) -> Duration {
        Duration::from_millis(self.align_interval_ms)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }
}
