// THREAD METADATA RECORDS
// The two records a validator persists between restarts.
//
// SAFETY INVARIANTS:
// 1. core_major_version == -1 marks an approvement thread that was never bootstrapped
// 2. The generation cursor's next_index only increases
// 3. prev_hash always names the block at next_index - 1

use crate::crypto::{sha256_hex, ZERO_HASH};
use crate::epoch::EpochRecord;
use crate::error::{ConsensusError, ConsensusResult};
use crate::params::NetworkParameters;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Sentinel version for a record that has not been initialized from genesis.
pub const UNINITIALIZED_VERSION: i64 = -1;

/// Epoch, quorum and finalization cache this node is tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovementThread {
    pub core_major_version: i64,
    pub network_parameters: NetworkParameters,
    pub epoch: EpochRecord,
    /// Finalized aggregates collected since the last checkpoint.
    #[serde(default)]
    pub cache: BTreeMap<String, Value>,
}

impl ApprovementThread {
    pub fn uninitialized() -> Self {
        ApprovementThread {
            core_major_version: UNINITIALIZED_VERSION,
            network_parameters: NetworkParameters::new(),
            epoch: EpochRecord {
                id: 0,
                hash: String::new(),
                pools_registry: BTreeMap::new(),
                quorum: Vec::new(),
                leaders_sequence: Vec::new(),
                start_timestamp: 0,
                current_leader_index: 0,
            },
            cache: BTreeMap::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.core_major_version != UNINITIALIZED_VERSION
    }

    /// The network runs a newer major version than `local_major`.
    pub fn is_outdated_for(&self, local_major: i64) -> bool {
        self.core_major_version > local_major
    }

    pub fn is_epoch_active(&self, now_ms: u64) -> ConsensusResult<bool> {
        let epoch_time = self.network_parameters.epoch_time()?;
        Ok(self.epoch.is_active(now_ms, epoch_time))
    }

    /// Drop everything accumulated since the previous checkpoint.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }
}

/// Block-production cursor of this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationThread {
    pub epoch_full_id: String,
    pub prev_hash: String,
    pub next_index: u64,
}

impl GenerationThread {
    /// Cursor used before the node has produced anything on this network.
    pub fn genesis(network_id: &str) -> Self {
        GenerationThread {
            epoch_full_id: format!("{}#-1", sha256_hex(&format!("{}{}", ZERO_HASH, network_id))),
            prev_hash: ZERO_HASH.to_string(),
            next_index: 0,
        }
    }

    /// Record that the block at `next_index` was produced with `block_hash`.
    pub fn advance(&mut self, block_hash: &str) {
        self.prev_hash = block_hash.to_string();
        self.next_index += 1;
    }

    /// Move the cursor onto a new epoch. Block numbering restarts per epoch.
    pub fn enter_epoch(&mut self, epoch_full_id: &str) -> ConsensusResult<()> {
        if self.epoch_full_id == epoch_full_id {
            return Ok(());
        }
        if epoch_full_id.is_empty() {
            return Err(ConsensusError::InvalidEpochTransition(
                "empty epoch full id".to_string(),
            ));
        }
        self.epoch_full_id = epoch_full_id.to_string();
        self.prev_hash = ZERO_HASH.to_string();
        self.next_index = 0;
        Ok(())
    }

    pub fn last_index(&self) -> i64 {
        self.next_index as i64 - 1
    }
}
