//! Durable state of the protochain validator: key-value seam, thread metadata
//! records and genesis bootstrap.

pub mod genesis;
pub mod kv;
pub mod metadata;

pub use genesis::{bootstrap, BootstrapOutcome, GenesisConfig};
pub use kv::{KeyValueStore, MemoryStore, SledStore, StorageError};
pub use metadata::{ThreadMetadataStore, APPROVE_THREAD_KEY, GEN_THREAD_KEY};
