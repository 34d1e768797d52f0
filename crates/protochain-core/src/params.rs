// Network parameters: the string-keyed mapping shipped with every approvement thread.

use crate::error::{ConsensusError, ConsensusResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Duration of one epoch in milliseconds.
pub const EPOCH_TIME: &str = "EPOCH_TIME";
/// Milliseconds each leader keeps the right to produce before rotation.
pub const LEADERSHIP_TIMEFRAME: &str = "LEADERSHIP_TIMEFRAME";
/// Target quorum size when selecting the next epoch's quorum.
pub const QUORUM_SIZE: &str = "QUORUM_SIZE";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkParameters(BTreeMap<String, Value>);

impl NetworkParameters {
    pub fn new() -> Self {
        NetworkParameters(BTreeMap::new())
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Read a non-negative integer parameter.
    ///
    /// A missing or non-integer value is a configuration error: consensus
    /// cannot guess deadlines.
    pub fn require_u64(&self, key: &str) -> ConsensusResult<u64> {
        match self.0.get(key) {
            Some(value) => value.as_u64().ok_or_else(|| {
                ConsensusError::Configuration(format!(
                    "network parameter {} must be a non-negative integer, got {}",
                    key, value
                ))
            }),
            None => Err(ConsensusError::Configuration(format!(
                "network parameter {} is missing",
                key
            ))),
        }
    }

    pub fn epoch_time(&self) -> ConsensusResult<u64> {
        self.require_u64(EPOCH_TIME)
    }

    pub fn leadership_timeframe(&self) -> ConsensusResult<u64> {
        self.require_u64(LEADERSHIP_TIMEFRAME)
    }

    pub fn quorum_size(&self) -> Option<usize> {
        self.0.get(QUORUM_SIZE).and_then(Value::as_u64).map(|n| n as usize)
    }
}
