//! Protochain validator node.
//!
//! The consensus core lives in the `protochain-*` workspace crates; this crate
//! loads configuration and wires them into a running node.

pub mod config;
pub mod node;

pub use config::{NodeConfig, StorageBackend};
pub use node::{load_or_generate_signer, ValidatorNode};
