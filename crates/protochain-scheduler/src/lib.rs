//! Consensus worker scheduler of the protochain validator.
//!
//! Every duty runs on its own timer against one shared [`DutyContext`]; see
//! [`ConsensusScheduler::start`].

pub mod context;
pub mod duties;
pub mod duty;
pub mod error;
pub mod scheduler;
pub mod settings;

pub use context::{cache_if_final, DutyContext, PeerView};
pub use duty::{run_duty, Duty};
pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::ConsensusScheduler;
pub use settings::SchedulerSettings;
