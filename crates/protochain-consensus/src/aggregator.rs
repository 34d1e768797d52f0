// FINALIZATION PROOF AGGREGATOR
// Collects quorum signatures per block, per epoch and per leader rotation.
//
// SAFETY INVARIANTS:
// 1. A validator signature is counted once per proof, whatever its key casing
// 2. Only members of the quorum of the proof's own epoch may contribute
// 3. Signatures are never removed before the proof is finalized and checkpointed
// 4. Proofs for epochs this node never tracked are rejected, never checked against the current quorum

use log::{debug, info, warn};
use protochain_core::{
    count_quorum_signatures, quorum_majority, ConsensusError, ConsensusResult,
    EpochFinalizationProof, EpochRecord, FinalizationProof, LeaderRotationProof, SignatureMap,
    SignatureVerifier,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// How many past epochs keep their quorum on record for proof validation.
pub const QUORUM_HISTORY_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProofId {
    Block { epoch_id: u64, block_id: String },
    Epoch(u64),
    LeaderRotation { epoch_id: u64, leader_index: usize },
}

impl ProofId {
    pub fn epoch_id(&self) -> u64 {
        match self {
            ProofId::Block { epoch_id, .. } => *epoch_id,
            ProofId::Epoch(epoch_id) => *epoch_id,
            ProofId::LeaderRotation { epoch_id, .. } => *epoch_id,
        }
    }
}

/// Epoch a finalized-proof cache key (`AFP:`, `AEFP:`, `ALRP:`) belongs to.
pub fn cache_key_epoch(key: &str) -> Option<u64> {
    let (_, rest) = key.split_once(':')?;
    rest.split(':').next()?.parse().ok()
}

impl fmt::Display for ProofId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProofId::Block { block_id, .. } => write!(f, "AFP:{}", block_id),
            ProofId::Epoch(epoch_id) => write!(f, "AEFP:{}", epoch_id),
            ProofId::LeaderRotation {
                epoch_id,
                leader_index,
            } => write!(f, "ALRP:{}:{}", epoch_id, leader_index),
        }
    }
}

/// The statement being signed, together with the signatures gathered so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProofBody {
    Block(FinalizationProof),
    Epoch(EpochFinalizationProof),
    LeaderRotation {
        skipped_leader: String,
        proof: LeaderRotationProof,
    },
}

impl ProofBody {
    pub fn signatures(&self) -> &SignatureMap {
        match self {
            ProofBody::Block(proof) => &proof.signatures,
            ProofBody::Epoch(proof) => &proof.signatures,
            ProofBody::LeaderRotation { proof, .. } => &proof.signatures,
        }
    }

    fn signatures_mut(&mut self) -> &mut SignatureMap {
        match self {
            ProofBody::Block(proof) => &mut proof.signatures,
            ProofBody::Epoch(proof) => &mut proof.signatures,
            ProofBody::LeaderRotation { proof, .. } => &mut proof.signatures,
        }
    }

    pub fn signing_payload(&self, epoch_full_id: &str) -> String {
        match self {
            ProofBody::Block(proof) => proof.signing_payload(epoch_full_id),
            ProofBody::Epoch(proof) => proof.signing_payload(epoch_full_id),
            ProofBody::LeaderRotation {
                skipped_leader,
                proof,
            } => proof.signing_payload(skipped_leader, epoch_full_id),
        }
    }

    /// Same statement, no signatures.
    pub fn unsigned(&self) -> ProofBody {
        let mut body = self.clone();
        body.signatures_mut().clear();
        body
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofStatus {
    Pending,
    Final,
}

/// Quorum on record for one epoch.
#[derive(Debug, Clone)]
struct EpochQuorum {
    full_id: String,
    quorum: Vec<String>,
}

impl EpochQuorum {
    fn majority(&self) -> usize {
        quorum_majority(self.quorum.len())
    }

    /// The quorum's spelling of `validator`, if it is a member.
    fn canonical_member(&self, validator: &str) -> Option<&String> {
        self.quorum
            .iter()
            .find(|member| member.eq_ignore_ascii_case(validator))
    }
}

#[derive(Debug, Default)]
pub struct FinalizationAggregator {
    epochs: BTreeMap<u64, EpochQuorum>,
    pending: HashMap<ProofId, ProofBody>,
}

impl FinalizationAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the quorum of an epoch so proofs for it can be counted later.
    pub fn register_epoch(&mut self, epoch: &EpochRecord) {
        self.epochs.insert(
            epoch.id,
            EpochQuorum {
                full_id: epoch.full_id(),
                quorum: epoch.quorum.clone(),
            },
        );
        while self.epochs.len() > QUORUM_HISTORY_DEPTH {
            if let Some((&oldest, _)) = self.epochs.iter().next() {
                self.epochs.remove(&oldest);
                self.pending.retain(|id, _| id.epoch_id() != oldest);
            }
        }
    }

    pub fn knows_epoch(&self, epoch_id: u64) -> bool {
        self.epochs.contains_key(&epoch_id)
    }

    fn epoch(&self, epoch_id: u64) -> ConsensusResult<&EpochQuorum> {
        self.epochs
            .get(&epoch_id)
            .ok_or(ConsensusError::UnknownEpoch(epoch_id))
    }

    pub fn majority_for(&self, epoch_id: u64) -> ConsensusResult<usize> {
        Ok(self.epoch(epoch_id)?.majority())
    }

    /// Start collecting signatures for a statement. Re-opening keeps what was gathered.
    pub fn open(&mut self, id: ProofId, body: ProofBody) -> ConsensusResult<()> {
        self.epoch(id.epoch_id())?;
        if self.pending.contains_key(&id) {
            return Ok(());
        }
        debug!("Opened proof {}", id);
        self.pending.insert(id, body.unsigned());
        Ok(())
    }

    pub fn is_open(&self, id: &ProofId) -> bool {
        self.pending.contains_key(id)
    }

    /// The statement opened under `id`, without its signatures.
    pub fn statement(&self, id: &ProofId) -> Option<ProofBody> {
        self.pending.get(id).map(ProofBody::unsigned)
    }

    /// Payload validators sign for this proof.
    pub fn signing_payload(&self, id: &ProofId) -> ConsensusResult<String> {
        let quorum = self.epoch(id.epoch_id())?;
        let body = self
            .pending
            .get(id)
            .ok_or_else(|| ConsensusError::UnknownProof(id.to_string()))?;
        Ok(body.signing_payload(&quorum.full_id))
    }

    /// Record a signature. Returns `false` when this validator had already signed.
    ///
    /// The caller is responsible for having checked the signature; see
    /// [`FinalizationAggregator::submit_verified`].
    pub fn submit_signature(
        &mut self,
        id: &ProofId,
        validator: &str,
        signature: &str,
    ) -> ConsensusResult<bool> {
        let epoch_id = id.epoch_id();
        let member = self
            .epoch(epoch_id)?
            .canonical_member(validator)
            .cloned()
            .ok_or_else(|| ConsensusError::UnknownValidator {
                validator: validator.to_string(),
                epoch_id,
            })?;

        let body = self
            .pending
            .get_mut(id)
            .ok_or_else(|| ConsensusError::UnknownProof(id.to_string()))?;
        let signatures = body.signatures_mut();
        if signatures.contains_key(&member) {
            return Ok(false);
        }
        signatures.insert(member, signature.to_string());
        Ok(true)
    }

    /// Check the signature against the proof payload, then record it.
    pub fn submit_verified(
        &mut self,
        id: &ProofId,
        validator: &str,
        signature: &str,
        verifier: &dyn SignatureVerifier,
    ) -> ConsensusResult<bool> {
        let payload = self.signing_payload(id)?;
        if !verifier.verify(&payload, validator, signature) {
            warn!("Rejected signature from {} for {}", validator, id);
            return Err(ConsensusError::InvalidSignature {
                validator: validator.to_string(),
                proof: id.to_string(),
            });
        }
        self.submit_signature(id, validator, signature)
    }

    pub fn signature_count(&self, id: &ProofId) -> ConsensusResult<usize> {
        self.pending
            .get(id)
            .map(|body| body.signatures().len())
            .ok_or_else(|| ConsensusError::UnknownProof(id.to_string()))
    }

    pub fn status(&self, id: &ProofId) -> ConsensusResult<ProofStatus> {
        let count = self.signature_count(id)?;
        let majority = self.majority_for(id.epoch_id())?;
        if count > 0 && count >= majority {
            Ok(ProofStatus::Final)
        } else {
            Ok(ProofStatus::Pending)
        }
    }

    /// Snapshot of a finalized proof.
    pub fn build_aggregate(&self, id: &ProofId) -> ConsensusResult<ProofBody> {
        if self.status(id)? != ProofStatus::Final {
            return Err(ConsensusError::ProofNotFinal(id.to_string()));
        }
        self.pending
            .get(id)
            .cloned()
            .ok_or_else(|| ConsensusError::UnknownProof(id.to_string()))
    }

    /// Check a proof received from a peer against the quorum of the epoch it claims.
    ///
    /// An empty signature set is merely pending (`Ok(false)`); an epoch this node
    /// has no quorum for is rejected.
    pub fn validate_incoming(
        &self,
        epoch_id: u64,
        proof: &ProofBody,
        verifier: &dyn SignatureVerifier,
    ) -> ConsensusResult<bool> {
        let quorum = self.epoch(epoch_id)?;
        if proof.signatures().is_empty() {
            return Ok(false);
        }
        let payload = proof.signing_payload(&quorum.full_id);
        let valid = count_quorum_signatures(&payload, proof.signatures(), &quorum.quorum, verifier);
        Ok(valid >= quorum.majority())
    }

    /// Drop every proof still being gathered for an epoch.
    pub fn invalidate_epoch(&mut self, epoch_id: u64) -> usize {
        let before = self.pending.len();
        self.pending.retain(|id, _| id.epoch_id() != epoch_id);
        let dropped = before - self.pending.len();
        if dropped > 0 {
            info!("Dropped {} in-flight proofs of epoch {}", dropped, epoch_id);
        }
        dropped
    }

    /// Remove and return every finalized proof.
    pub fn checkpoint(&mut self) -> Vec<(ProofId, ProofBody)> {
        let final_ids: Vec<ProofId> = self
            .pending
            .keys()
            .filter(|id| matches!(self.status(id), Ok(ProofStatus::Final)))
            .cloned()
            .collect();

        let mut finalized: Vec<(ProofId, ProofBody)> = final_ids
            .into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|body| (id, body)))
            .collect();
        finalized.sort_by(|a, b| a.0.cmp(&b.0));
        finalized
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
