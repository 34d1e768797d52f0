// EPOCH RECORD
// The unit of leadership: a fixed quorum and leader order for a bounded time window.
//
// SAFETY INVARIANTS:
// 1. Epoch ID increases monotonically across replacements
// 2. Quorum is non-empty and the leaders sequence is drawn from it
// 3. current_leader_index stays inside the leaders sequence and never decreases
// 4. Leader order is fixed for the lifetime of the epoch

use crate::error::{ConsensusError, ConsensusResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Compute the number of signatures required for a quorum of `size` members.
///
/// Formula: min(floor(2n/3) + 1, n). A single-member quorum needs one signature.
pub fn quorum_majority(size: usize) -> usize {
    let required = (2 * size) / 3 + 1;
    required.min(size)
}

/// A storage/compute pool participating in the network.
///
/// Consensus only reads the stake (for quorum and leader selection) and the
/// endpoint (for peers that want to fetch blocks).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub total_stake: u64,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// Monotonic epoch number.
    pub id: u64,

    /// Digest seeding quorum and leader order.
    pub hash: String,

    /// Pools known at epoch start, keyed by validator public key.
    #[serde(default)]
    pub pools_registry: BTreeMap<String, PoolRecord>,

    /// Validators entitled to sign for this epoch.
    pub quorum: Vec<String>,

    /// Leader order, fixed for the epoch.
    pub leaders_sequence: Vec<String>,

    /// Epoch start (milliseconds since UNIX epoch).
    pub start_timestamp: u64,

    /// Index into `leaders_sequence` of the current block producer.
    pub current_leader_index: usize,
}

impl EpochRecord {
    /// Identity string binding signatures to this exact epoch: `"{hash}#{id}"`.
    pub fn full_id(&self) -> String {
        format!("{}#{}", self.hash, self.id)
    }

    pub fn quorum_majority(&self) -> usize {
        quorum_majority(self.quorum.len())
    }

    pub fn current_leader(&self) -> ConsensusResult<&str> {
        self.leader_at(self.current_leader_index)
    }

    pub fn leader_at(&self, index: usize) -> ConsensusResult<&str> {
        if self.leaders_sequence.is_empty() {
            return Err(ConsensusError::EpochState(format!(
                "epoch {} has an empty leaders sequence",
                self.id
            )));
        }
        self.leaders_sequence
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| {
                ConsensusError::EpochState(format!(
                    "leader index {} outside sequence of {} in epoch {}",
                    index,
                    self.leaders_sequence.len(),
                    self.id
                ))
            })
    }

    /// Position of a validator in the leaders sequence.
    pub fn leader_position(&self, validator: &str) -> Option<usize> {
        self.leaders_sequence.iter().position(|key| key == validator)
    }

    pub fn has_next_candidate(&self) -> bool {
        self.current_leader_index + 1 < self.leaders_sequence.len()
    }

    pub fn is_quorum_member(&self, validator: &str) -> bool {
        self.quorum.iter().any(|key| key.eq_ignore_ascii_case(validator))
    }

    /// True while `start_timestamp + epoch_time > now`.
    pub fn is_active(&self, now_ms: u64, epoch_time: u64) -> bool {
        self.start_timestamp.saturating_add(epoch_time) > now_ms
    }

    /// The moment the leader at `index` loses its slot.
    pub fn leader_deadline(&self, index: usize, leadership_timeframe: u64) -> u64 {
        self.start_timestamp
            .saturating_add((index as u64 + 1).saturating_mul(leadership_timeframe))
    }

    /// Check the structural invariants of the record.
    pub fn validate(&self) -> ConsensusResult<()> {
        if self.quorum.is_empty() {
            return Err(ConsensusError::EpochState(format!(
                "epoch {} has an empty quorum",
                self.id
            )));
        }
        if self.leaders_sequence.is_empty() {
            return Err(ConsensusError::EpochState(format!(
                "epoch {} has an empty leaders sequence",
                self.id
            )));
        }
        if self.current_leader_index >= self.leaders_sequence.len() {
            return Err(ConsensusError::EpochState(format!(
                "leader index {} outside sequence of {} in epoch {}",
                self.current_leader_index,
                self.leaders_sequence.len(),
                self.id
            )));
        }
        if let Some(stranger) = self
            .leaders_sequence
            .iter()
            .find(|leader| !self.is_quorum_member(leader))
        {
            return Err(ConsensusError::EpochState(format!(
                "leader {} of epoch {} is not a quorum member",
                stranger, self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch(leaders: &[&str]) -> EpochRecord {
        EpochRecord {
            id: 0,
            hash: "seed".to_string(),
            pools_registry: BTreeMap::new(),
            quorum: leaders.iter().map(|s| s.to_string()).collect(),
            leaders_sequence: leaders.iter().map(|s| s.to_string()).collect(),
            start_timestamp: 0,
            current_leader_index: 0,
        }
    }

    #[test]
    fn test_quorum_majority_table() {
        let expected = [(1, 1), (2, 2), (3, 3), (4, 3), (5, 4), (10, 7), (100, 67)];
        for (n, majority) in expected {
            assert_eq!(quorum_majority(n), majority, "n = {}", n);
        }
    }

    #[test]
    fn test_full_id() {
        let mut e = epoch(&["a"]);
        e.id = 12;
        assert_eq!(e.full_id(), "seed#12");
    }

    #[test]
    fn test_current_leader_empty_sequence() {
        let mut e = epoch(&["a"]);
        e.leaders_sequence.clear();
        assert!(matches!(
            e.current_leader(),
            Err(ConsensusError::EpochState(_))
        ));
    }

    #[test]
    fn test_next_candidate() {
        let mut e = epoch(&["a", "b"]);
        assert!(e.has_next_candidate());
        e.current_leader_index = 1;
        assert!(!e.has_next_candidate());
        assert_eq!(e.current_leader().unwrap(), "b");
    }

    #[test]
    fn test_is_active_boundary() {
        let mut e = epoch(&["a"]);
        e.start_timestamp = 1_000;
        assert!(e.is_active(1_999, 1_000));
        assert!(!e.is_active(2_000, 1_000));
    }

    #[test]
    fn test_leader_deadline() {
        let e = epoch(&["a", "b", "c"]);
        assert_eq!(e.leader_deadline(0, 1_000), 1_000);
        assert_eq!(e.leader_deadline(2, 1_000), 3_000);
    }

    #[test]
    fn test_validate_rejects_outsider_leader() {
        let mut e = epoch(&["a", "b"]);
        e.leaders_sequence.push("mallory".to_string());
        assert!(e.validate().is_err());
    }

    #[test]
    fn test_quorum_membership_ignores_case() {
        let e = epoch(&["AbCd"]);
        assert!(e.is_quorum_member("abcd"));
        assert!(!e.is_quorum_member("abce"));
    }
}
