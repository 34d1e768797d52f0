// GENESIS BOOTSTRAP
// Builds the first epoch from the genesis document when no usable state is persisted.
//
// SAFETY INVARIANTS:
// 1. Genesis is applied only when the approvement thread is absent or carries the -1 sentinel
// 2. The genesis state is persisted before the node starts any duty
// 3. Every node reading the same document derives the same epoch 0

use crate::metadata::ThreadMetadataStore;
use log::info;
use protochain_core::selection::{leaders_sequence, select_quorum};
use protochain_core::{
    blake3_hex, ApprovementThread, ConsensusError, ConsensusResult, EpochRecord,
    GenerationThread, NetworkParameters, PoolRecord, UNINITIALIZED_VERSION,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// The genesis document (`genesis.toml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenesisConfig {
    #[serde(rename = "NETWORK_ID")]
    pub network_id: String,

    #[serde(rename = "CORE_MAJOR_VERSION", default)]
    pub core_major_version: Option<i64>,

    #[serde(rename = "FIRST_EPOCH_START_TIMESTAMP")]
    pub first_epoch_start_timestamp: u64,

    /// Must contain EPOCH_TIME and LEADERSHIP_TIMEFRAME.
    #[serde(rename = "NETWORK_PARAMETERS")]
    pub network_parameters: NetworkParameters,

    #[serde(rename = "POOLS", default)]
    pub pools: BTreeMap<String, PoolRecord>,

    /// Explicit initial quorum. When empty it is selected from POOLS by stake.
    #[serde(rename = "QUORUM", default)]
    pub quorum: Vec<String>,
}

impl GenesisConfig {
    pub fn from_toml_str(contents: &str) -> ConsensusResult<Self> {
        toml::from_str(contents)
            .map_err(|err| ConsensusError::Configuration(format!("invalid genesis: {}", err)))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> ConsensusResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|err| {
            ConsensusError::Configuration(format!(
                "cannot read genesis file {}: {}",
                path.display(),
                err
            ))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn genesis_hash(&self) -> String {
        blake3_hex(&format!(
            "{}:{}",
            self.network_id, self.first_epoch_start_timestamp
        ))
    }

    /// Derive epoch 0 and its approvement thread.
    pub fn build_approvement_thread(&self, local_major: i64) -> ConsensusResult<ApprovementThread> {
        self.network_parameters.epoch_time()?;
        self.network_parameters.leadership_timeframe()?;

        let hash = self.genesis_hash();
        let quorum = if self.quorum.is_empty() {
            let size = self
                .network_parameters
                .quorum_size()
                .unwrap_or(self.pools.len());
            select_quorum(&self.pools, size, &hash)
        } else {
            self.quorum.clone()
        };
        if quorum.is_empty() {
            return Err(ConsensusError::Configuration(
                "genesis defines neither QUORUM nor POOLS".to_string(),
            ));
        }

        let epoch = EpochRecord {
            id: 0,
            hash: hash.clone(),
            pools_registry: self.pools.clone(),
            leaders_sequence: leaders_sequence(&self.pools, &quorum, &hash),
            quorum,
            start_timestamp: self.first_epoch_start_timestamp,
            current_leader_index: 0,
        };
        epoch.validate()?;

        let version = match self.core_major_version {
            Some(version) if version != UNINITIALIZED_VERSION => version,
            _ => local_major,
        };

        Ok(ApprovementThread {
            core_major_version: version,
            network_parameters: self.network_parameters.clone(),
            epoch,
            cache: BTreeMap::new(),
        })
    }
}

/// Result of bringing the thread records up at startup.
#[derive(Debug, Clone)]
pub struct BootstrapOutcome {
    pub approvement: ApprovementThread,
    pub generation: GenerationThread,
    /// True when genesis was applied during this call.
    pub applied_genesis: bool,
}

/// Load persisted thread records, applying genesis where needed.
pub fn bootstrap(
    metadata: &ThreadMetadataStore,
    genesis: &GenesisConfig,
    local_major: i64,
) -> ConsensusResult<BootstrapOutcome> {
    let persisted = metadata.load_approvement_thread()?;
    let (approvement, applied_genesis) = match persisted {
        Some(thread) if thread.is_initialized() => (thread, false),
        _ => {
            let thread = genesis.build_approvement_thread(local_major)?;
            metadata.save_approvement_thread(&thread)?;
            info!(
                "Applied genesis for network {}: epoch {} with {} quorum members",
                genesis.network_id,
                thread.epoch.full_id(),
                thread.epoch.quorum.len()
            );
            (thread, true)
        }
    };

    let generation = match metadata.load_generation_thread()? {
        Some(cursor) => cursor,
        None => {
            let cursor = GenerationThread::genesis(&genesis.network_id);
            metadata.save_generation_thread(&cursor)?;
            cursor
        }
    };

    Ok(BootstrapOutcome {
        approvement,
        generation,
        applied_genesis,
    })
}
