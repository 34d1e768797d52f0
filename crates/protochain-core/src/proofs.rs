// FINALIZATION PROOFS
// Quorum-signed attestations over blocks, epochs and leader rotations.
//
// SAFETY INVARIANTS:
// 1. Each proof binds its signatures to one epoch through the epoch full id
// 2. Signature maps are keyed by validator key, so one validator counts once
// 3. A proof is final exactly when distinct valid quorum signatures reach majority

use crate::crypto::SignatureVerifier;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Validator public key (hex) -> signature (hex).
pub type SignatureMap = BTreeMap<String, String>;

/// Aggregated finalization proof for a single block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizationProof {
    pub prev_hash: String,
    pub block_id: String,
    pub block_hash: String,
    #[serde(default)]
    pub signatures: SignatureMap,
}

impl FinalizationProof {
    pub fn new(prev_hash: String, block_id: String, block_hash: String) -> Self {
        FinalizationProof {
            prev_hash,
            block_id,
            block_hash,
            signatures: SignatureMap::new(),
        }
    }

    pub fn signing_payload(&self, epoch_full_id: &str) -> String {
        format!(
            "{}{}{}{}",
            self.prev_hash, self.block_id, self.block_hash, epoch_full_id
        )
    }
}

/// Aggregated proof that an epoch is finished and which block closed it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochFinalizationProof {
    pub last_leader_index: usize,
    pub last_block_index: i64,
    pub last_block_hash: String,
    pub first_block_hash_by_last_leader: String,
    #[serde(default)]
    pub signatures: SignatureMap,
}

impl EpochFinalizationProof {
    pub fn signing_payload(&self, epoch_full_id: &str) -> String {
        format!(
            "EPOCH_DONE:{}:{}:{}:{}:{}",
            self.last_leader_index,
            self.last_block_index,
            self.last_block_hash,
            self.first_block_hash_by_last_leader,
            epoch_full_id
        )
    }
}

/// Aggregated proof that the quorum agreed to move past a leader.
///
/// `skip_index` is the index of the last block the skipped leader produced,
/// or -1 when it produced nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderRotationProof {
    pub first_block_hash: String,
    pub skip_index: i64,
    pub skip_hash: String,
    #[serde(default)]
    pub signatures: SignatureMap,
}

impl Default for LeaderRotationProof {
    fn default() -> Self {
        LeaderRotationProof {
            first_block_hash: String::new(),
            skip_index: -1,
            skip_hash: String::new(),
            signatures: SignatureMap::new(),
        }
    }
}

impl LeaderRotationProof {
    pub fn produced_blocks(&self) -> bool {
        self.skip_index >= 0
    }

    pub fn signing_payload(&self, skipped_leader: &str, epoch_full_id: &str) -> String {
        format!(
            "LEADER_ROTATION_PROOF:{}:{}:{}:{}:{}",
            skipped_leader,
            self.first_block_hash,
            self.skip_index,
            self.skip_hash,
            epoch_full_id
        )
    }
}

/// Count distinct quorum members whose signature over `payload` verifies.
///
/// Keys are compared case-insensitively; non-members and bad signatures are ignored.
pub fn count_quorum_signatures(
    payload: &str,
    signatures: &SignatureMap,
    quorum: &[String],
    verifier: &dyn SignatureVerifier,
) -> usize {
    let members: HashSet<String> = quorum.iter().map(|key| key.to_ascii_lowercase()).collect();
    let mut seen = HashSet::new();
    for (key, signature) in signatures {
        let lowered = key.to_ascii_lowercase();
        if members.contains(&lowered)
            && !seen.contains(&lowered)
            && verifier.verify(payload, key, signature)
        {
            seen.insert(lowered);
        }
    }
    seen.len()
}
