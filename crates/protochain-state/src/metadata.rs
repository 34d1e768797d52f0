// THREAD METADATA STORE
// Durable load/save of the approvement and generation thread records.
//
// SAFETY INVARIANTS:
// 1. Each record is written as one JSON value under a fixed key (whole-record replacement)
// 2. Writers are serialized, so two saves never interleave
// 3. A record that fails to decode is reported and treated as absent, never as fatal

use crate::kv::KeyValueStore;
use log::{error, warn};
use parking_lot::Mutex;
use protochain_core::{ApprovementThread, ConsensusError, ConsensusResult, GenerationThread};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

pub const GEN_THREAD_KEY: &str = "GEN_THREAD";
pub const APPROVE_THREAD_KEY: &str = "APPROVE_THREAD";

pub struct ThreadMetadataStore {
    store: Arc<dyn KeyValueStore>,
    write_lock: Mutex<()>,
}

impl ThreadMetadataStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        ThreadMetadataStore {
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub fn load_approvement_thread(&self) -> ConsensusResult<Option<ApprovementThread>> {
        self.load(APPROVE_THREAD_KEY)
    }

    pub fn save_approvement_thread(&self, record: &ApprovementThread) -> ConsensusResult<()> {
        self.save(APPROVE_THREAD_KEY, record)
    }

    pub fn load_generation_thread(&self) -> ConsensusResult<Option<GenerationThread>> {
        self.load(GEN_THREAD_KEY)
    }

    pub fn save_generation_thread(&self, record: &GenerationThread) -> ConsensusResult<()> {
        self.save(GEN_THREAD_KEY, record)
    }

    /// Persist both records as one checkpoint.
    pub fn save_checkpoint(
        &self,
        approvement: &ApprovementThread,
        generation: &GenerationThread,
    ) -> ConsensusResult<()> {
        self.save(APPROVE_THREAD_KEY, approvement)?;
        self.save(GEN_THREAD_KEY, generation)
    }

    /// Read failures are errors; missing or undecodable records are `None`.
    fn load<T: DeserializeOwned>(&self, key: &str) -> ConsensusResult<Option<T>> {
        let raw = match self.store.get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(None),
            Err(err) => {
                error!("Failed to read {} from the metadata store: {}", key, err);
                return Err(ConsensusError::Storage(err.to_string()));
            }
        };

        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                let corruption = ConsensusError::PersistenceCorruption {
                    key: key.to_string(),
                    reason: err.to_string(),
                };
                warn!("{}; falling back to genesis state", corruption);
                Ok(None)
            }
        }
    }

    fn save<T: Serialize>(&self, key: &str, record: &T) -> ConsensusResult<()> {
        let serialized = serde_json::to_string(record)?;
        let _guard = self.write_lock.lock();
        self.store
            .put(key, &serialized)
            .map_err(|err| ConsensusError::Storage(err.to_string()))
    }
}
