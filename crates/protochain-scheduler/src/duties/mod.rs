pub mod align;
pub mod discover;
pub mod gather;
pub mod propose;
pub mod rotate;

pub use align::AlignVerificationDuty;
pub use discover::DiscoverEpochDuty;
pub use gather::GatherProofsDuty;
pub use propose::ProposeDuty;
pub use rotate::RotateDuty;
