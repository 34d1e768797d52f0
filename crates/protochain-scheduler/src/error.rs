use protochain_core::ConsensusError;
use protochain_p2p::TransportError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl SchedulerError {
    /// Fatal errors stop the duty that raised them.
    pub fn is_fatal(&self) -> bool {
        match self {
            SchedulerError::Consensus(err) => err.is_fatal(),
            SchedulerError::Transport(_) => false,
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
