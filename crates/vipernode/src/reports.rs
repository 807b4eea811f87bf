//! QoS report commit-reveal over fisherman test results
//!
//! Once a sampled session ends, the fisherman scores each servicer from
//! its stored test results, commits to them with a Merkle root and reveals
//! one leaf chosen by the hash of the block after the session.

use crate::cache::CacheError;
use crate::error::ErrorCode;
use crate::interfaces::{retry_transient, ChainError, ChainHandles};
use crate::metrics::Metrics;
use crate::node::ViperNode;
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use vipernet_core::crypto::required_index;
use vipernet_core::merkle::{verify_proof, MerkleError, MerkleLeaf, MerkleTree};
use vipernet_core::msgs::{MsgSubmitQosReport, QosReport};
use vipernet_core::*;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("invalid qos report: {0}")]
    Invalid(String),
    #[error("qos report signature does not verify")]
    InvalidSignature,
    #[error("invalid test leaf: {0}")]
    InvalidProofs(String),
    #[error("sample proof rejected: {0}")]
    InvalidMerkleVerify(String),
    #[error("replay attack: {0}")]
    ReplayAttack(String),
    #[error("{0} is not part of the session")]
    NotInSession(Address),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Core(#[from] vipernet_core::Error),
}

impl ReportError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ReportError::Invalid(_) => ErrorCode::InvalidClaim,
            ReportError::InvalidSignature => ErrorCode::InvalidSignature,
            ReportError::InvalidProofs(_) => ErrorCode::InvalidProofs,
            ReportError::InvalidMerkleVerify(_) => ErrorCode::InvalidClaimMerkleVerify,
            ReportError::ReplayAttack(_) => ErrorCode::ReplayAttack,
            ReportError::NotInSession(_) => ErrorCode::NodeNotInSession,
            ReportError::Cache(e) => e.code(),
            ReportError::Chain(e) => e.code(),
            ReportError::Core(_) => ErrorCode::Internal,
        }
    }
}

impl From<MerkleError> for ReportError {
    fn from(e: MerkleError) -> Self {
        match e {
            MerkleError::ReplayAttack(reason) => ReportError::ReplayAttack(reason),
            other => ReportError::InvalidMerkleVerify(other.to_string()),
        }
    }
}

// =============================================================================
// SCORING
// =============================================================================

/// Mean latency over answered samples.
pub fn average_latency(results: &[TestResult]) -> Option<Duration> {
    let answered: Vec<Duration> = results
        .iter()
        .filter(|r| r.is_available)
        .map(|r| r.latency)
        .collect();
    if answered.is_empty() {
        return None;
    }
    let total: Duration = answered.iter().sum();
    Some(total / answered.len() as u32)
}

/// Score one servicer's samples.
///
/// `fastest` is the lowest [`average_latency`] among every servicer of the
/// session sampled by this fisherman.
pub fn compute_qos(
    results: &[TestResult],
    fastest: Option<Duration>,
) -> vipernet_core::Result<QosScores> {
    let total = results.len() as u64;
    if total == 0 {
        return Ok(QosScores::uniform(Dec::zero()));
    }
    let answered = results.iter().filter(|r| r.is_available).count() as u64;
    let matched = results.iter().filter(|r| r.is_reliable).count() as u64;

    let availability = Dec::one()
        .checked_sub(Dec::from_ratio(total - answered, total)?)?
        .clamp_unit();
    let reliability = Dec::from_ratio(matched, total)?.clamp_unit();
    let latency = match (average_latency(results), fastest) {
        (None, _) => Dec::zero(),
        (Some(own), _) if own.is_zero() => Dec::one(),
        (Some(own), Some(fastest)) => {
            Dec::from_ratio(fastest.as_micros() as u64, own.as_micros().max(1) as u64)?
                .clamp_unit()
        }
        (Some(_), None) => Dec::one(),
    };
    Ok(QosScores {
        latency,
        availability,
        reliability,
    })
}

// =============================================================================
// CHAIN-SIDE VALIDATION
// =============================================================================

/// Height whose block hash selects the revealed test leaf.
pub fn report_reveal_height(header: &SessionHeader, params: &ProtocolParams) -> u64 {
    header.session_block_height + params.blocks_per_session
}

/// Last height a QoS report for the session is accepted at.
pub fn report_deadline(header: &SessionHeader, params: &ProtocolParams) -> u64 {
    params.session_end(header.session_block_height)
        + params.report_card_submission_window * params.blocks_per_session
}

/// Check a QoS report submitted at `height` by `fisherman` against the
/// derived `session`.
pub fn validate_qos_report(
    msg: &MsgSubmitQosReport,
    fisherman: &PublicKey,
    session: &Session,
    params: &ProtocolParams,
    height: u64,
    reveal_block_hash: &Hash32,
) -> Result<(), ReportError> {
    msg.validate_basic()
        .map_err(|e| ReportError::Invalid(e.to_string()))?;
    if session.header != msg.header {
        return Err(ReportError::Invalid("report names another session".into()));
    }
    let end = params.session_end(msg.header.session_block_height);
    if height <= end || height > report_deadline(&msg.header, params) {
        return Err(ReportError::Invalid(format!(
            "height {height} is outside the report window of session {}",
            msg.header.session_block_height
        )));
    }
    if msg.num_of_test_results < params.minimum_sample_relays {
        return Err(ReportError::Invalid(format!(
            "{} samples is below the minimum of {}",
            msg.num_of_test_results, params.minimum_sample_relays
        )));
    }

    if fisherman.address() != msg.fisherman_address || !session.has_fisherman(&msg.fisherman_address) {
        return Err(ReportError::NotInSession(msg.fisherman_address));
    }
    if !session.has_servicer(&msg.servicer_address) {
        return Err(ReportError::NotInSession(msg.servicer_address));
    }
    msg.report
        .verify(fisherman)
        .map_err(|_| ReportError::InvalidSignature)?;

    let index = required_index(reveal_block_hash, &msg.header, msg.num_of_test_results)?;
    if msg.merkle_proof.target_index != index {
        return Err(ReportError::InvalidProofs(format!(
            "report reveals leaf {}, leaf {index} is required",
            msg.merkle_proof.target_index
        )));
    }
    verify_proof(
        &msg.report.sample_root,
        &msg.merkle_proof,
        &msg.leaf.leaf_hash()?,
        msg.num_of_test_results,
    )?;
    Ok(())
}

// =============================================================================
// FISHERMAN-SIDE ENGINE
// =============================================================================

/// Outcome counts of one scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportTickStats {
    pub submitted: u32,
    pub deleted: u32,
    pub failed: u32,
    pub deferred: u32,
}

impl ReportTickStats {
    pub fn touched(&self) -> bool {
        self.submitted + self.deleted + self.failed + self.deferred > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Waiting,
    Submitted,
    Deleted,
}

pub struct ReportEngine {
    chain: ChainHandles,
    metrics: Metrics,
    retry_window: Duration,
}

impl ReportEngine {
    pub fn new(chain: ChainHandles, metrics: Metrics, retry_window: Duration) -> Self {
        Self {
            chain,
            metrics,
            retry_window,
        }
    }

    /// Scan a node's test results at `height`, bounded by `budget`.
    pub async fn tick(&self, node: &ViperNode, height: u64, budget: Duration) -> ReportTickStats {
        let mut stats = ReportTickStats::default();
        let keys = node.results.keys();
        if keys.is_empty() {
            return stats;
        }
        let params = match retry_transient(self.retry_window, || self.chain.staking.params(height)).await {
            Ok(p) => p,
            Err(e) => {
                warn!(height, error = %e, "cannot load protocol params, skipping report scan");
                return stats;
            }
        };

        let mut sets: Vec<(Hash32, FishermanResult)> = keys
            .into_iter()
            .filter_map(|k| node.results.get(&k).map(|r| (k, r)))
            .collect();
        seal_ended_sessions(node, &mut sets, &params, height);

        let started = Instant::now();
        for (i, (key, set)) in sets.iter().enumerate() {
            if started.elapsed() > budget {
                stats.deferred = (sets.len() - i) as u32;
                break;
            }
            match self.process(node, key, set, height, &params).await {
                Ok(Step::Waiting) => {}
                Ok(Step::Submitted) => stats.submitted += 1,
                Ok(Step::Deleted) => stats.deleted += 1,
                Err(e) => {
                    stats.failed += 1;
                    warn!(
                        fisherman = %node.address(),
                        servicer = %set.servicer_address,
                        code = e.code().as_u32(),
                        error = %e,
                        "qos report failed"
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
        set: &FishermanResult,
        height: u64,
        params: &ProtocolParams,
    ) -> Result<Step, ReportError> {
        let header = &set.header;
        if height <= params.session_end(header.session_block_height) {
            return Ok(Step::Waiting);
        }
        if height > report_deadline(header, params) {
            info!(fisherman = %node.address(), servicer = %set.servicer_address, "report window closed, dropping samples");
            node.results.delete(key)?;
            return Ok(Step::Deleted);
        }
        let reveal_height = report_reveal_height(header, params);
        if height < reveal_height {
            return Ok(Step::Waiting);
        }

        let existing = retry_transient(self.retry_window, || {
            self.chain.tx.get_qos_report(header, &set.servicer_address)
        })
        .await?;
        if existing.is_some() {
            node.results.delete(key)?;
            return Ok(Step::Deleted);
        }
        if set.num_test_results < params.minimum_sample_relays {
            debug!(
                servicer = %set.servicer_address,
                samples = set.num_test_results,
                minimum = params.minimum_sample_relays,
                "too few samples for a report"
            );
            node.results.delete(key)?;
            return Ok(Step::Deleted);
        }

        let tree = MerkleTree::from_leaves(&set.test_results)?;
        let block_hash = retry_transient(self.retry_window, || {
            self.chain.blocks.block_hash(reveal_height)
        })
        .await?;
        let index = required_index(&block_hash, header, set.num_test_results)?;
        let merkle_proof = tree.proof(index)?;
        let leaf = tree
            .original_index(index)
            .and_then(|i| set.test_results.get(i))
            .cloned()
            .ok_or(MerkleError::IndexOutOfRange {
                index,
                total: set.num_test_results,
            })?;

        let scores = compute_qos(&set.test_results, set.session_fastest)?;
        let mut report = QosReport {
            first_sample_timestamp_ms: set
                .test_results
                .iter()
                .map(|r| r.timestamp_ms)
                .min()
                .unwrap_or_default(),
            servicer_address: set.servicer_address,
            latency_score: scores.latency,
            availability_score: scores.availability,
            reliability_score: scores.reliability,
            sample_root: tree.root(),
            nonce: rand::thread_rng().gen(),
            signature: Signature([0; 64]),
        };
        report.signature = node.keypair().sign(&report.hash()?.0);

        let msg = MsgSubmitQosReport {
            header: header.clone(),
            servicer_address: set.servicer_address,
            fisherman_address: node.address(),
            report,
            evidence_type: EvidenceType::FishermanTestEvidence,
            merkle_proof,
            leaf,
            num_of_test_results: set.num_test_results,
        };

        let address = node.address();
        match retry_transient(self.retry_window, || {
            self.chain.tx.submit_qos_report(&address, msg.clone())
        })
        .await
        {
            Ok(()) => {
                self.metrics.qos_reports.with_label_values(&["submitted"]).inc();
                info!(
                    fisherman = %address,
                    servicer = %set.servicer_address,
                    session = header.session_block_height,
                    samples = set.num_test_results,
                    latency = %scores.latency,
                    availability = %scores.availability,
                    reliability = %scores.reliability,
                    "qos report submitted"
                );
                node.results.delete(key)?;
                Ok(Step::Submitted)
            }
            Err(e) => {
                self.metrics.qos_reports.with_label_values(&["failed"]).inc();
                let code = e.code();
                if code.deletes_evidence()
                    || code == ErrorCode::InvalidClaim
                    || code == ErrorCode::NodeNotInSession
                {
                    node.results.delete(key)?;
                }
                Err(e.into())
            }
        }
    }
}

/// Seal the result sets of every ended session in one pass.
///
/// Each set records the lowest average latency over all sets of its
/// session, so a report retried or deferred to a later tick is scored the
/// same as its siblings. Sets sealed on an earlier tick keep their value.
fn seal_ended_sessions(
    node: &ViperNode,
    sets: &mut [(Hash32, FishermanResult)],
    params: &ProtocolParams,
    height: u64,
) {
    let ended = |set: &FishermanResult| height > params.session_end(set.header.session_block_height);

    let mut fastest: HashMap<Hash32, Option<Duration>> = HashMap::new();
    for (_, set) in sets.iter().filter(|(_, set)| ended(set)) {
        let Ok(session) = set.header.hash() else {
            continue;
        };
        let latency = if set.sealed {
            set.session_fastest
        } else {
            average_latency(&set.test_results)
        };
        let slot = fastest.entry(session).or_insert(None);
        *slot = match (*slot, latency) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }

    for (key, set) in sets.iter_mut() {
        if set.sealed || !ended(set) {
            continue;
        }
        let session_fastest = set
            .header
            .hash()
            .ok()
            .and_then(|h| fastest.get(&h).copied())
            .flatten();
        if node.results.seal_scored(key, session_fastest) {
            set.seal_scored(session_fastest);
        }
    }
}
