//! Core data model of the protochain validator.

pub mod block;
pub mod clock;
pub mod crypto;
pub mod epoch;
pub mod error;
pub mod params;
pub mod proofs;
pub mod selection;
pub mod threads;

/// Major protocol version implemented by this build.
pub const CORE_MAJOR_VERSION: i64 = 1;

pub use block::{block_id, parse_block_id, BlockHeader};
pub use clock::{Clock, ManualClock, SystemClock};
pub use crypto::{
    blake3_hex, sha256_hex, Ed25519Signer, Ed25519Verifier, MessageSigner, SignatureVerifier,
    ZERO_HASH,
};
pub use epoch::{quorum_majority, EpochRecord, PoolRecord};
pub use error::{ConsensusError, ConsensusResult};
pub use params::NetworkParameters;
pub use proofs::{
    count_quorum_signatures, EpochFinalizationProof, FinalizationProof, LeaderRotationProof,
    SignatureMap,
};
pub use threads::{ApprovementThread, GenerationThread, UNINITIALIZED_VERSION};
