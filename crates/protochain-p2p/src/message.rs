// PEER MESSAGES
// Decoded view of every packet kind the consensus core sends or consumes.
//
// SAFETY INVARIANTS:
// 1. Every envelope carries the protocol version, a timestamp and the sender key
// 2. The set of message kinds is closed; handlers match it exhaustively
// 3. Type codes are stable across releases

use crate::transport::TransportError;
use protochain_consensus::{ProofBody, ProofId};
use protochain_core::{BlockHeader, EpochFinalizationProof, LeaderRotationProof};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Wire protocol version stamped on outbound envelopes.
pub const PROTOCOL_VERSION: u32 = 1;

/// What a validator reports about its own view of consensus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorState {
    pub epoch_id: u64,
    pub epoch_full_id: String,
    pub current_leader_index: usize,
    pub generation_index: i64,
    pub core_major_version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum PeerMessage {
    ValidatorState(ValidatorState),

    /// A new block from the current leader. The first block of a leader
    /// carries the rotation proofs of the leaders it replaced, keyed by their index.
    BlockAnnouncement {
        header: BlockHeader,
        #[serde(default)]
        rotation_proofs: BTreeMap<usize, LeaderRotationProof>,
    },

    /// Ask the quorum to sign a statement.
    SignatureRequest { id: ProofId, body: ProofBody },

    /// One validator's signature over the statement behind `id`. The signer is the envelope sender.
    SignatureShare { id: ProofId, signature: String },

    /// Aggregated proof that the quorum moved past a leader.
    LeaderRotationProof {
        epoch_id: u64,
        leader_index: usize,
        skipped_leader: String,
        proof: LeaderRotationProof,
    },

    /// Aggregated proof that an epoch is done.
    EpochFinalizationProof {
        epoch_id: u64,
        proof: EpochFinalizationProof,
    },

    SyncTimestamp { timestamp: u64 },
}

impl PeerMessage {
    pub fn type_code(&self) -> u8 {
        match self {
            PeerMessage::ValidatorState(_) => 1,
            PeerMessage::BlockAnnouncement { .. } => 2,
            PeerMessage::SignatureRequest { .. } => 3,
            PeerMessage::SignatureShare { .. } => 4,
            PeerMessage::LeaderRotationProof { .. } => 5,
            PeerMessage::EpochFinalizationProof { .. } => 6,
            PeerMessage::SyncTimestamp { .. } => 7,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::ValidatorState(_) => "validator-state",
            PeerMessage::BlockAnnouncement { .. } => "block-announcement",
            PeerMessage::SignatureRequest { .. } => "signature-request",
            PeerMessage::SignatureShare { .. } => "signature-share",
            PeerMessage::LeaderRotationProof { .. } => "leader-rotation-proof",
            PeerMessage::EpochFinalizationProof { .. } => "epoch-finalization-proof",
            PeerMessage::SyncTimestamp { .. } => "sync-timestamp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub timestamp: u64,
    pub sender: String,
    pub message: PeerMessage,
}

impl Envelope {
    pub fn new(sender: &str, timestamp: u64, message: PeerMessage) -> Self {
        Envelope {
            version: PROTOCOL_VERSION,
            timestamp,
            sender: sender.to_string(),
            message,
        }
    }

    pub fn type_code(&self) -> u8 {
        self.message.type_code()
    }

    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(self).map_err(|e| TransportError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        let envelope: Envelope =
            serde_json::from_slice(bytes).map_err(|e| TransportError::Codec(e.to_string()))?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(TransportError::UnsupportedVersion(envelope.version));
        }
        Ok(envelope)
    }
}
