// CONSENSUS ERROR TAXONOMY
// Every failure the consensus core can surface to a duty or to the operator.
//
// SAFETY INVARIANTS:
// 1. Configuration and epoch-state errors are fatal for the duty that hits them
// 2. Persistence corruption is recovered by genesis bootstrap, never propagated as a crash
// 3. Unknown-epoch errors reject one message and never touch local state
// 4. Version mismatch is non-fatal: the node keeps syncing but stops finalizing

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsensusError {
    /// A required network parameter is missing or malformed.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A persisted record could not be decoded.
    #[error("Persisted record {key} is corrupted: {reason}")]
    PersistenceCorruption { key: String, reason: String },

    /// A proof or message references an epoch this node never tracked.
    #[error("Unknown epoch {0}")]
    UnknownEpoch(u64),

    /// The active epoch record violates its own invariants.
    #[error("Malformed epoch record: {0}")]
    EpochState(String),

    /// The persisted state was written by a newer core than this node runs.
    #[error("Core version mismatch: local major {local}, network requires {required}")]
    VersionMismatch { local: i64, required: i64 },

    #[error("Validator {validator} is not a quorum member of epoch {epoch_id}")]
    UnknownValidator { validator: String, epoch_id: u64 },

    #[error("Signature from {validator} does not verify for {proof}")]
    InvalidSignature { validator: String, proof: String },

    #[error("Proof {0} has not reached quorum majority")]
    ProofNotFinal(String),

    #[error("No proof is being aggregated under {0}")]
    UnknownProof(String),

    #[error("Invalid epoch transition: {0}")]
    InvalidEpochTransition(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ConsensusError {
    /// Fatal errors stop the duty that raised them instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConsensusError::Configuration(_) | ConsensusError::EpochState(_)
        )
    }
}

impl From<serde_json::Error> for ConsensusError {
    fn from(err: serde_json::Error) -> Self {
        ConsensusError::Serialization(err.to_string())
    }
}

pub type ConsensusResult<T> = Result<T, ConsensusError>;
