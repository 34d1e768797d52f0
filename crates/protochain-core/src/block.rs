// Minimal block header produced by the leader. Payload handling lives outside consensus.

use crate::crypto::blake3_hex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub creator: String,
    pub epoch_id: u64,
    pub epoch_full_id: String,
    pub index: u64,
    pub prev_hash: String,
    pub timestamp: u64,
}

impl BlockHeader {
    /// `"{epoch_id}:{creator}:{index}"`
    pub fn id(&self) -> String {
        block_id(self.epoch_id, &self.creator, self.index)
    }

    pub fn hash(&self) -> String {
        blake3_hex(&format!(
            "{}:{}:{}:{}:{}",
            self.creator, self.epoch_full_id, self.index, self.prev_hash, self.timestamp
        ))
    }
}

pub fn block_id(epoch_id: u64, creator: &str, index: u64) -> String {
    format!("{}:{}:{}", epoch_id, creator, index)
}

/// Split a block id into `(epoch_id, creator, index)`.
pub fn parse_block_id(id: &str) -> Option<(u64, &str, u64)> {
    let mut parts = id.splitn(3, ':');
    let epoch_id = parts.next()?.parse().ok()?;
    let creator = parts.next()?;
    let index = parts.next()?.parse().ok()?;
    if creator.is_empty() {
        return None;
    }
    Some((epoch_id, creator, index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id_roundtrip() {
        let id = block_id(4, "deadbeef", 17);
        assert_eq!(id, "4:deadbeef:17");
        assert_eq!(parse_block_id(&id), Some((4, "deadbeef", 17)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_block_id("x:y:z"), None);
        assert_eq!(parse_block_id("1::2"), None);
        assert_eq!(parse_block_id("1:abc"), None);
    }

    #[test]
    fn test_hash_depends_on_prev_hash() {
        let header = BlockHeader {
            creator: "a".into(),
            epoch_id: 0,
            epoch_full_id: "h#0".into(),
            index: 0,
            prev_hash: "p".into(),
            timestamp: 1,
        };
        let mut other = header.clone();
        other.prev_hash = "q".into();
        assert_ne!(header.hash(), other.hash());
    }
}
