//! Validator node assembly: storage, bootstrap, consensus state and scheduler.

use crate::config::{NodeConfig, StorageBackend};
use anyhow::{bail, Context, Result};
use protochain_consensus::{ConsensusHandle, ConsensusState};
use protochain_core::{
    Clock, ConsensusError, Ed25519Signer, Ed25519Verifier, MessageSigner, CORE_MAJOR_VERSION,
};
use protochain_p2p::Transport;
use protochain_scheduler::{ConsensusScheduler, DutyContext};
use protochain_state::{
    bootstrap, GenesisConfig, KeyValueStore, MemoryStore, SledStore, ThreadMetadataStore,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Read the validator key seed, generating and storing one when the file is missing.
pub fn load_or_generate_signer(path: &Path) -> Result<Ed25519Signer> {
    if path.exists() {
        let seed = fs::read_to_string(path)
            .with_context(|| format!("Failed to read key file: {}", path.display()))?;
        return match Ed25519Signer::from_hex_seed(&seed) {
            Some(signer) => Ok(signer),
            None => bail!(
                "Invalid key file {}: expected 64 hex characters",
                path.display()
            ),
        };
    }

    info!(path = %path.display(), "Key file not found, generating new validator key");
    let signer = Ed25519Signer::generate();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create key directory: {}", parent.display()))?;
    }
    fs::write(path, signer.seed_hex())
        .with_context(|| format!("Failed to write key file: {}", path.display()))?;
    Ok(signer)
}

fn open_store(config: &NodeConfig) -> Result<Arc<dyn KeyValueStore>> {
    match config.storage.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::Sled => {
            let path = config.database_path();
            let store = SledStore::open(&path)
                .with_context(|| format!("Failed to open database at {}", path.display()))?;
            Ok(Arc::new(store))
        }
    }
}

/// A running validator.
pub struct ValidatorNode {
    scheduler: ConsensusScheduler,
    metadata: Arc<ThreadMetadataStore>,
}

impl ValidatorNode {
    /// Bootstrap persisted state and start every consensus duty.
    pub fn start(
        config: &NodeConfig,
        signer: Ed25519Signer,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let genesis = GenesisConfig::load(&config.node.genesis_path)?;
        let metadata = Arc::new(ThreadMetadataStore::new(open_store(config)?));

        let outcome = bootstrap(&metadata, &genesis, CORE_MAJOR_VERSION)?;
        info!(
            network = %genesis.network_id,
            epoch = %outcome.approvement.epoch.full_id(),
            applied_genesis = outcome.applied_genesis,
            validator = %signer.public_key(),
            "Consensus state loaded"
        );
        if !outcome.approvement.epoch.is_quorum_member(signer.public_key()) {
            warn!("This validator is not in the current quorum; it will follow without signing");
        }

        let handle = ConsensusHandle::new(ConsensusState::new(
            outcome.approvement,
            outcome.generation,
        ));
        let ctx = DutyContext::new(
            handle,
            metadata.clone(),
            transport,
            Arc::new(signer),
            Arc::new(Ed25519Verifier),
            clock,
            config.scheduler.clone(),
            CORE_MAJOR_VERSION,
        );
        match ctx.epochs.check_version() {
            Ok(()) => {}
            Err(err @ ConsensusError::VersionMismatch { .. }) => {
                warn!(error = %err, "Node is outdated; syncing without finalizing")
            }
            Err(err) => return Err(err.into()),
        }

        let scheduler = ConsensusScheduler::start(Arc::new(ctx));
        Ok(ValidatorNode {
            scheduler,
            metadata,
        })
    }

    pub fn handle(&self) -> &ConsensusHandle {
        &self.scheduler.context().handle
    }

    pub fn metadata(&self) -> &Arc<ThreadMetadataStore> {
        &self.metadata
    }

    pub fn running_duties(&self) -> Vec<&'static str> {
        self.scheduler.running_duties()
    }

    /// Stop every duty and write the final checkpoint.
    pub async fn shutdown(self) -> Result<()> {
        self.scheduler
            .shutdown()
            .await
            .context("Failed to checkpoint consensus state")
    }
}
