// DUTY CONTEXT
// Everything a duty needs, owned explicitly and shared behind one Arc.
//
// SAFETY INVARIANTS:
// 1. Consensus state is only reached through the ConsensusHandle
// 2. No state lock is held while awaiting the network
// 3. Every network operation is bounded by the configured timeout

use crate::error::{SchedulerError, SchedulerResult};
use crate::settings::SchedulerSettings;
use parking_lot::Mutex;
use protochain_consensus::{
    ConsensusHandle, ConsensusState, EpochLifecycleManager, LeaderRotationEngine, ProofBody,
    ProofId, ProofStatus,
};
use protochain_core::{Clock, ConsensusResult, MessageSigner, SignatureVerifier};
use protochain_p2p::{Envelope, PeerMessage, Transport, TransportError, ValidatorState};
use protochain_state::ThreadMetadataStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info};

/// Latest report received from one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerView {
    pub state: Option<ValidatorState>,
    /// Peer clock minus local clock, from its last sync timestamp.
    pub clock_skew_ms: Option<i64>,
}

pub struct DutyContext {
    pub handle: ConsensusHandle,
    pub epochs: EpochLifecycleManager,
    pub rotation: LeaderRotationEngine,
    pub metadata: Arc<ThreadMetadataStore>,
    pub transport: Arc<dyn Transport>,
    pub signer: Arc<dyn MessageSigner>,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub clock: Arc<dyn Clock>,
    pub settings: SchedulerSettings,
    pub peer_views: Mutex<HashMap<String, PeerView>>,
}

impl DutyContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handle: ConsensusHandle,
        metadata: Arc<ThreadMetadataStore>,
        transport: Arc<dyn Transport>,
        signer: Arc<dyn MessageSigner>,
        verifier: Arc<dyn SignatureVerifier>,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
        local_major: i64,
    ) -> Self {
        DutyContext {
            epochs: EpochLifecycleManager::new(handle.clone(), local_major),
            rotation: LeaderRotationEngine::new(handle.clone()),
            handle,
            metadata,
            transport,
            signer,
            verifier,
            clock,
            settings,
            peer_views: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_key(&self) -> &str {
        self.signer.public_key()
    }

    pub fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    pub async fn broadcast(&self, message: PeerMessage) -> SchedulerResult<()> {
        let envelope = Envelope::new(self.local_key(), self.now(), message);
        let limit = self.settings.network_timeout();
        match timeout(limit, self.transport.broadcast(envelope)).await {
            Ok(result) => result.map_err(SchedulerError::from),
            Err(_) => Err(TransportError::Timeout(self.settings.network_timeout_ms).into()),
        }
    }

    /// Sign the statement behind `id` with the local key and count it.
    ///
    /// Returns `None` when this node may not sign: it is outdated or outside
    /// the quorum of the proof's epoch.
    pub fn sign_own(&self, state: &mut ConsensusState, id: &ProofId) -> ConsensusResult<Option<String>> {
        if !state.eligible_to_finalize {
            return Ok(None);
        }
        if id.epoch_id() == state.approvement.epoch.id
            && !state.approvement.epoch.is_quorum_member(self.local_key())
        {
            return Ok(None);
        }
        let payload = state.aggregator.signing_payload(id)?;
        let signature = self.signer.sign(&payload);
        state
            .aggregator
            .submit_signature(id, self.local_key(), &signature)?;
        Ok(Some(signature))
    }

    /// Persist both thread records as they are now.
    pub fn persist(&self) -> SchedulerResult<()> {
        let (approvement, generation) = self.handle.snapshot();
        self.metadata.save_checkpoint(&approvement, &generation)?;
        Ok(())
    }

    /// Flush transient state and write the checkpoint.
    pub fn checkpoint(&self) -> SchedulerResult<()> {
        let (approvement, generation) = self.handle.checkpoint()?;
        self.metadata.save_checkpoint(&approvement, &generation)?;
        info!(
            epoch = %approvement.epoch.full_id(),
            next_index = generation.next_index,
            "Checkpoint written"
        );
        Ok(())
    }
}

/// Move a proof that just reached majority into the approvement cache.
///
/// Returns the aggregate the first time the proof is seen final.
pub fn cache_if_final(state: &mut ConsensusState, id: &ProofId) -> ConsensusResult<Option<ProofBody>> {
    if state.aggregator.status(id)? != ProofStatus::Final {
        return Ok(None);
    }
    let key = id.to_string();
    if state.approvement.cache.contains_key(&key) {
        return Ok(None);
    }
    let aggregate = state.aggregator.build_aggregate(id)?;
    state
        .approvement
        .cache
        .insert(key, serde_json::to_value(&aggregate)?);
    debug!(proof = %id, signatures = aggregate.signatures().len(), "Proof finalized");
    Ok(Some(aggregate))
}
