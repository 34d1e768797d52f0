//! Epoch lifecycle, leader rotation and finalization proof aggregation.
//!
//! All components share one [`ConsensusHandle`]; none of them keeps state of
//! its own outside that lock.

pub mod aggregator;
pub mod epoch_manager;
pub mod rotation;
pub mod state;

pub use aggregator::{
    cache_key_epoch, FinalizationAggregator, ProofBody, ProofId, ProofStatus, QUORUM_HISTORY_DEPTH,
};
pub use epoch_manager::{finalization_statement, EpochLifecycleManager};
pub use rotation::{
    rotation_deadline_passed, rotation_statement, validate_rotation_chain, LeaderRotationEngine,
    RotationOutcome,
};
pub use state::{ConsensusHandle, ConsensusState, LeaderTip};
