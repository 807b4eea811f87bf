//! Claim/proof commit-reveal over relay and challenge evidence
//!
//! Per evidence: `Open → Sealed (claim emitted) → Claimed (claim on chain)
//! → Proved | Expired | Slashed`. Terminal states delete local state.
//!
//! The reveal index is derived from the hash of the block at
//! `session_block_height + claim_submission_window × blocks_per_session`,
//! which does not exist yet when the claim is committed.

use crate::cache::CacheError;
use crate::challenge::check_challenge;
use crate::error::ErrorCode;
use crate::interfaces::{retry_transient, ChainError, ChainHandles};
use crate::metrics::Metrics;
use crate::node::ViperNode;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use vipernet_core::crypto::required_index;
use vipernet_core::merkle::{verify_proof, MerkleError, MerkleLeaf, MerkleTree};
use vipernet_core::msgs::{MsgClaim, MsgProof, MsgSubmitQosReport, MIN_CLAIM_PROOFS};
use vipernet_core::*;

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("invalid claim: {0}")]
    InvalidClaim(String),
    #[error("invalid proof: {0}")]
    InvalidProofs(String),
    #[error("merkle proof rejected: {0}")]
    InvalidMerkleVerify(String),
    #[error("replay attack: {0}")]
    ReplayAttack(String),
    #[error("no claim found for this proof")]
    ClaimNotFound,
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Core(#[from] vipernet_core::Error),
}

impl ClaimError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ClaimError::InvalidClaim(_) => ErrorCode::InvalidClaim,
            ClaimError::InvalidProofs(_) => ErrorCode::InvalidProofs,
            ClaimError::InvalidMerkleVerify(_) => ErrorCode::InvalidClaimMerkleVerify,
            ClaimError::ReplayAttack(_) => ErrorCode::ReplayAttack,
            ClaimError::ClaimNotFound => ErrorCode::ClaimNotFound,
            ClaimError::Cache(e) => e.code(),
            ClaimError::Chain(e) => e.code(),
            ClaimError::Core(_) => ErrorCode::Internal,
        }
    }
}

impl From<MerkleError> for ClaimError {
    fn from(e: MerkleError) -> Self {
        match e {
            MerkleError::ReplayAttack(reason) => ClaimError::ReplayAttack(reason),
            other => ClaimError::InvalidMerkleVerify(other.to_string()),
        }
    }
}

// =============================================================================
// CHAIN-SIDE VALIDATION
// =============================================================================

/// Height whose block hash selects the revealed relay leaf.
pub fn proof_height(header: &SessionHeader, params: &ProtocolParams) -> u64 {
    header.session_block_height + params.claim_submission_window * params.blocks_per_session
}

/// Last height a claim for a session may still be acted on.
pub fn claim_deadline(header: &SessionHeader, params: &ProtocolParams) -> u64 {
    params.session_end(header.session_block_height)
        + params.claim_expiration * params.blocks_per_session
}

/// Check a claim message at submission height `height`.
pub fn validate_claim(
    msg: &MsgClaim,
    params: &ProtocolParams,
    height: u64,
) -> Result<(), ClaimError> {
    msg.validate_basic()
        .map_err(|e| ClaimError::InvalidClaim(e.to_string()))?;
    let shb = msg.header.session_block_height;
    if params.session_start(shb) != shb {
        return Err(ClaimError::InvalidClaim(format!(
            "{shb} is not a session boundary"
        )));
    }
    if height <= params.session_end(shb) {
        return Err(ClaimError::InvalidClaim("session has not ended".into()));
    }
    let reveal = proof_height(&msg.header, params);
    if height >= reveal {
        return Err(ClaimError::InvalidClaim(format!(
            "claim at {height} is too late, leaf selection is fixed by block {reveal}"
        )));
    }
    if height > claim_deadline(&msg.header, params) {
        return Err(ClaimError::InvalidClaim("claim window has closed".into()));
    }
    if msg.evidence_type == EvidenceType::RelayEvidence
        && msg.total_proofs < params.minimum_number_of_proofs
    {
        return Err(ClaimError::InvalidClaim(format!(
            "{} relays is below the minimum of {}",
            msg.total_proofs, params.minimum_number_of_proofs
        )));
    }
    Ok(())
}

/// Check a proof message against its claim.
///
/// `reveal_block_hash` is the hash at [`proof_height`]; `servicer` is the
/// claimant as staked at the session start; `report` is the stored QoS
/// report when the message also reveals a test leaf.
pub fn validate_proof_message(
    msg: &MsgProof,
    claim: &MsgClaim,
    reveal_block_hash: &Hash32,
    servicer: &Validator,
    report: Option<&MsgSubmitQosReport>,
) -> Result<(), ClaimError> {
    msg.validate_basic()
        .map_err(|e| ClaimError::InvalidProofs(e.to_string()))?;
    if msg.claim_evidence_type != claim.evidence_type {
        return Err(ClaimError::InvalidProofs(format!(
            "proof is {:?} evidence, claim is {:?}",
            msg.claim_evidence_type, claim.evidence_type
        )));
    }

    let index = required_index(reveal_block_hash, &claim.header, claim.total_proofs)?;
    if msg.claim_merkle_proof.target_index != index {
        return Err(ClaimError::InvalidProofs(format!(
            "proof reveals leaf {}, leaf {index} is required",
            msg.claim_merkle_proof.target_index
        )));
    }
    let leaf_hash = msg.claim_leaf.leaf_hash()?;
    verify_proof(
        &claim.merkle_root,
        &msg.claim_merkle_proof,
        &leaf_hash,
        claim.total_proofs,
    )?;
    check_leaf(&msg.claim_leaf, claim, servicer)?;

    if let (Some(merkle_proof), Some(leaf)) = (&msg.report_merkle_proof, &msg.report_leaf) {
        let report = report.ok_or_else(|| {
            ClaimError::InvalidProofs("no qos report to reveal a test leaf against".into())
        })?;
        if leaf.servicer_address != claim.from_address
            || report.servicer_address != claim.from_address
        {
            return Err(ClaimError::InvalidProofs(
                "test leaf does not belong to the claimant".into(),
            ));
        }
        verify_proof(
            &report.report.sample_root,
            merkle_proof,
            &leaf.leaf_hash()?,
            report.num_of_test_results,
        )?;
    }
    Ok(())
}

fn check_leaf(leaf: &Proof, claim: &MsgClaim, servicer: &Validator) -> Result<(), ClaimError> {
    if leaf.session_header() != claim.header {
        return Err(ClaimError::InvalidProofs(
            "leaf belongs to a different session".into(),
        ));
    }
    if servicer.address != claim.from_address || !servicer.serves_chain(&claim.header.chain) {
        return Err(ClaimError::InvalidProofs(format!(
            "{} did not serve chain {} at session start",
            claim.from_address, claim.header.chain
        )));
    }
    match leaf {
        Proof::Relay(proof) => {
            if proof.servicer_pubkey.address() != claim.from_address {
                return Err(ClaimError::InvalidProofs(
                    "relay was served by another servicer".into(),
                ));
            }
            proof
                .token
                .verify()
                .map_err(|e| ClaimError::InvalidProofs(format!("aat: {e}")))?;
            proof
                .verify_client_signature()
                .map_err(|e| ClaimError::InvalidProofs(format!("client signature: {e}")))?;
        }
        Proof::Challenge(challenge) => {
            check_challenge(challenge).map_err(|e| ClaimError::InvalidProofs(e.to_string()))?;
        }
    }
    Ok(())
}

// =============================================================================
// SERVICER-SIDE ENGINE
// =============================================================================

/// Outcome counts of one scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClaimTickStats {
    pub claimed: u32,
    pub proved: u32,
    pub deleted: u32,
    pub failed: u32,
    /// Evidence left for the next tick once the time box ran out
    pub deferred: u32,
}

impl ClaimTickStats {
    pub fn touched(&self) -> bool {
        self.claimed + self.proved + self.deleted + self.failed + self.deferred > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Waiting,
    Claimed,
    Proved,
    Deleted,
}

/// Drives each local evidence through claim and proof
pub struct ClaimEngine {
    chain: ChainHandles,
    metrics: Metrics,
    retry_window: Duration,
}

impl ClaimEngine {
    pub fn new(chain: ChainHandles, metrics: Metrics, retry_window: Duration) -> Self {
        Self {
            chain,
            metrics,
            retry_window,
        }
    }

    /// Scan a node's evidence at `height`, bounded by `budget`.
    pub async fn tick(&self, node: &ViperNode, height: u64, budget: Duration) -> ClaimTickStats {
        let mut stats = ClaimTickStats::default();
        let params = match retry_transient(self.retry_window, || self.chain.staking.params(height)).await {
            Ok(p) => p,
            Err(e) => {
                warn!(height, error = %e, "cannot load protocol params, skipping claim scan");
                return stats;
            }
        };

        let started = Instant::now();
        let keys = node.evidence.keys();
        for (i, key) in keys.iter().enumerate() {
            if started.elapsed() > budget {
                stats.deferred = (keys.len() - i) as u32;
                debug!(deferred = stats.deferred, "claim scan time box exhausted");
                break;
            }
            match self.process(node, key, height, &params).await {
                Ok(Step::Waiting) => {}
                Ok(Step::Claimed) => stats.claimed += 1,
                Ok(Step::Proved) => stats.proved += 1,
                Ok(Step::Deleted) => stats.deleted += 1,
                Err(e) => {
                    stats.failed += 1;
                    warn!(
                        node = %node.address(),
                        evidence = %key,
                        code = e.code().as_u32(),
                        error = %e,
                        "claim processing failed"
                    );
                }
            }
        }
        stats
    }

    async fn process(
        &self,
        node: &ViperNode,
        key: &Hash32,
        height: u64,
        params: &ProtocolParams,
    ) -> Result<Step, ClaimError> {
        let Some(evidence) = node.evidence.get(key) else {
            return Ok(Step::Waiting);
        };
        let header = evidence.header.clone();
        if height <= params.session_end(header.session_block_height) {
            return Ok(Step::Waiting);
        }
        if height > claim_deadline(&header, params) {
            info!(node = %node.address(), evidence = %key, "evidence expired unclaimed or unproved");
            node.evidence.delete(key)?;
            return Ok(Step::Deleted);
        }

        let address = node.address();
        let claim = retry_transient(self.retry_window, || {
            self.chain.tx.get_claim(&address, &header, evidence.evidence_type)
        })
        .await?;
        match claim {
            None if height >= proof_height(&header, params) => {
                info!(node = %node.address(), evidence = %key, "claim window closed before commit");
                node.evidence.delete(key)?;
                Ok(Step::Deleted)
            }
            None => self.claim(node, key, evidence, params).await,
            Some(claim) => self.prove(node, key, evidence, claim, params, height).await,
        }
    }

    async fn claim(
        &self,
        node: &ViperNode,
        key: &Hash32,
        evidence: Evidence,
        params: &ProtocolParams,
    ) -> Result<Step, ClaimError> {
        let minimum = match evidence.evidence_type {
            EvidenceType::RelayEvidence => params.minimum_number_of_proofs.max(MIN_CLAIM_PROOFS),
            _ => MIN_CLAIM_PROOFS,
        };
        if evidence.num_proofs < minimum {
            debug!(
                node = %node.address(),
                evidence = %key,
                proofs = evidence.num_proofs,
                minimum,
                "evidence below claim minimum, dropping"
            );
            node.evidence.delete(key)?;
            return Ok(Step::Deleted);
        }

        if !evidence.sealed {
            node.evidence.seal(key);
            self.metrics.evidence_sealed.inc();
        }
        // never commit to what could not be revealed after a restart
        node.evidence.flush()?;
        let Some(evidence) = node.evidence.get(key) else {
            return Ok(Step::Waiting);
        };

        let tree = MerkleTree::from_leaves(&evidence.proofs)?;
        let msg = MsgClaim {
            header: evidence.header.clone(),
            merkle_root: tree.root(),
            total_proofs: evidence.num_proofs,
            from_address: node.address(),
            evidence_type: evidence.evidence_type,
            expiration_height: 0,
        };
        if let Err(e) = msg.validate_basic() {
            node.evidence.delete(key)?;
            return Err(ClaimError::InvalidClaim(e.to_string()));
        }

        let address = node.address();
        match retry_transient(self.retry_window, || {
            self.chain.tx.submit_claim(&address, msg.clone())
        })
        .await
        {
            Ok(()) => {
                self.metrics
                    .claims
                    .with_label_values(&["claim", "submitted"])
                    .inc();
                info!(
                    node = %address,
                    session = evidence.header.session_block_height,
                    proofs = evidence.num_proofs,
                    root = %msg.merkle_root.hash,
                    "claim submitted"
                );
                Ok(Step::Claimed)
            }
            Err(e) => {
                self.metrics
                    .claims
                    .with_label_values(&["claim", "failed"])
                    .inc();
                if e.code() == ErrorCode::InvalidClaim || e.code().deletes_evidence() {
                    node.evidence.delete(key)?;
                }
                Err(e.into())
            }
        }
    }

    async fn prove(
        &self,
        node: &ViperNode,
        key: &Hash32,
        evidence: Evidence,
        claim: MsgClaim,
        params: &ProtocolParams,
        height: u64,
    ) -> Result<Step, ClaimError> {
        let reveal_height = proof_height(&claim.header, params);
        if height < reveal_height {
            return Ok(Step::Waiting);
        }
        let block_hash = retry_transient(self.retry_window, || {
            self.chain.blocks.block_hash(reveal_height)
        })
        .await?;
        let index = required_index(&block_hash, &claim.header, claim.total_proofs)?;

        let tree = MerkleTree::from_leaves(&evidence.proofs)?;
        if tree.root() != claim.merkle_root || evidence.num_proofs != claim.total_proofs {
            warn!(node = %node.address(), evidence = %key, "local evidence no longer matches its claim");
            node.evidence.delete(key)?;
            return Ok(Step::Deleted);
        }
        let claim_merkle_proof = tree.proof(index)?;
        let leaf = tree
            .original_index(index)
            .and_then(|i| evidence.proofs.get(i))
            .cloned()
            .ok_or(MerkleError::IndexOutOfRange {
                index,
                total: claim.total_proofs,
            })?;
        let msg = MsgProof {
            claim_merkle_proof,
            claim_leaf: leaf,
            claim_evidence_type: evidence.evidence_type,
            report_merkle_proof: None,
            report_leaf: None,
            report_evidence_type: None,
        };

        let address = node.address();
        match retry_transient(self.retry_window, || {
            self.chain.tx.submit_proof(&address, msg.clone())
        })
        .await
        {
            Ok(()) => {
                self.metrics
                    .claims
                    .with_label_values(&["proof", "submitted"])
                    .inc();
                info!(
                    node = %address,
                    session = claim.header.session_block_height,
                    index,
                    "proof accepted"
                );
                node.evidence.delete(key)?;
                Ok(Step::Proved)
            }
            Err(e) => {
                self.metrics
                    .claims
                    .with_label_values(&["proof", "failed"])
                    .inc();
                if e.code().deletes_evidence() {
                    warn!(node = %address, evidence = %key, code = e.code().as_u32(), "proof rejected, dropping evidence");
                    node.evidence.delete(key)?;
                }
                Err(e.into())
            }
        }
    }
}
