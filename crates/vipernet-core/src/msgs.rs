//! On-chain messages emitted by the claim/proof and report-card engines
//!
//! Messages carry a fixed fee in base units. Chain-side semantic checks
//! live with the engines; `validate_basic` here only checks structure.

use crate::canonical::canonical_json;
use crate::crypto;
use crate::decimal::Dec;
use crate::error::{Error, Result};
use crate::merkle::next_pow2;
use crate::types::*;
use serde::{Deserialize, Serialize};

/// Fee charged for a claim
pub const CLAIM_FEE: u64 = 10_000;
/// Fee charged for a proof reveal
pub const PROOF_FEE: u64 = 10_000;
/// Fee charged for a QoS report
pub const QOS_REPORT_FEE: u64 = 10_000;

/// Smallest evidence a claim may commit to.
pub const MIN_CLAIM_PROOFS: u64 = 5;

/// Commitment to an evidence set via its Merkle root.
///
/// `expiration_height` is zero when submitted and set by the chain.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MsgClaim {
    pub header: SessionHeader,
    pub merkle_root: HashRange,
    pub total_proofs: u64,
    pub from_address: Address,
    pub evidence_type: EvidenceType,
    pub expiration_height: u64,
}

impl MsgClaim {
    pub fn validate_basic(&self) -> Result<()> {
        self.header.validate_basic()?;
        if self.evidence_type == EvidenceType::FishermanTestEvidence {
            return Err(Error::invalid("claim", "fisherman results are not claimable"));
        }
        if self.total_proofs < MIN_CLAIM_PROOFS {
            return Err(Error::invalid(
                "claim",
                format!(
                    "{} proofs is below the minimum of {MIN_CLAIM_PROOFS}",
                    self.total_proofs
                ),
            ));
        }
        if self.merkle_root.hash.is_zero() {
            return Err(Error::invalid("claim", "merkle root is empty"));
        }
        if self.merkle_root.range.lower != 0
            || self.merkle_root.range.upper != next_pow2(self.total_proofs)
        {
            return Err(Error::invalid(
                "claim",
                "merkle root range does not match total proofs",
            ));
        }
        if self.expiration_height != 0 {
            return Err(Error::invalid("claim", "expiration height is set by the chain"));
        }
        Ok(())
    }
}

/// Reveal of one leaf under a prior claim.
///
/// The `report_*` slots are only filled by chain integrations that reveal
/// a QoS leaf together with the relay leaf; servicers leave them empty.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MsgProof {
    pub claim_merkle_proof: MerkleProof,
    pub claim_leaf: Proof,
    pub claim_evidence_type: EvidenceType,
    pub report_merkle_proof: Option<MerkleProof>,
    pub report_leaf: Option<TestResult>,
    pub report_evidence_type: Option<EvidenceType>,
}

impl MsgProof {
    pub fn validate_basic(&self) -> Result<()> {
        if self.claim_leaf.evidence_type() != self.claim_evidence_type {
            return Err(Error::EvidenceTypeMismatch {
                expected: self.claim_evidence_type,
                got: self.claim_leaf.evidence_type(),
            });
        }
        match (&self.report_merkle_proof, &self.report_leaf, self.report_evidence_type) {
            (None, None, None) => Ok(()),
            (Some(_), Some(_), Some(EvidenceType::FishermanTestEvidence)) => Ok(()),
            _ => Err(Error::invalid(
                "proof message",
                "report slots must be all empty or a complete fisherman reveal",
            )),
        }
    }

    /// The session the revealed leaf belongs to.
    pub fn header(&self) -> SessionHeader {
        self.claim_leaf.session_header()
    }
}

/// QoS summary a fisherman commits to for one servicer and session.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct QosReport {
    /// Unix milliseconds of the earliest sample
    pub first_sample_timestamp_ms: u64,
    pub servicer_address: Address,
    pub latency_score: Dec,
    pub availability_score: Dec,
    pub reliability_score: Dec,
    pub sample_root: HashRange,
    pub nonce: i64,
    /// Fisherman signature over [`QosReport::hash`]
    pub signature: Signature,
}

#[derive(Serialize)]
struct QosReportSignable<'a> {
    first_sample_timestamp_ms: u64,
    servicer_address: &'a Address,
    latency_score: Dec,
    availability_score: Dec,
    reliability_score: Dec,
    sample_root: &'a HashRange,
    nonce: i64,
}

impl QosReport {
    pub fn signable_bytes(&self) -> Result<Vec<u8>> {
        canonical_json(&QosReportSignable {
            first_sample_timestamp_ms: self.first_sample_timestamp_ms,
            servicer_address: &self.servicer_address,
            latency_score: self.latency_score,
            availability_score: self.availability_score,
            reliability_score: self.reliability_score,
            sample_root: &self.sample_root,
            nonce: self.nonce,
        })
    }

    pub fn hash(&self) -> Result<Hash32> {
        Ok(crypto::hash(&self.signable_bytes()?))
    }

    pub fn scores(&self) -> QosScores {
        QosScores {
            latency: self.latency_score,
            availability: self.availability_score,
            reliability: self.reliability_score,
        }
    }

    pub fn validate_basic(&self) -> Result<()> {
        for (name, score) in [
            ("latency", self.latency_score),
            ("availability", self.availability_score),
            ("reliability", self.reliability_score),
        ] {
            if score > Dec::one() {
                return Err(Error::invalid(
                    "qos report",
                    format!("{name} score {score} exceeds 1"),
                ));
            }
        }
        if self.sample_root.hash.is_zero() {
            return Err(Error::invalid("qos report", "sample root is empty"));
        }
        Ok(())
    }

    pub fn verify(&self, fisherman: &PublicKey) -> Result<()> {
        crypto::verify_signature(fisherman, &self.hash()?.0, &self.signature)
    }
}

/// Fisherman submission of a QoS report with one revealed test leaf.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MsgSubmitQosReport {
    pub header: SessionHeader,
    pub servicer_address: Address,
    pub fisherman_address: Address,
    pub report: QosReport,
    pub evidence_type: EvidenceType,
    pub merkle_proof: MerkleProof,
    pub leaf: TestResult,
    pub num_of_test_results: u64,
}

impl MsgSubmitQosReport {
    pub fn validate_basic(&self) -> Result<()> {
        self.header.validate_basic()?;
        self.report.validate_basic()?;
        if self.evidence_type != EvidenceType::FishermanTestEvidence {
            return Err(Error::EvidenceTypeMismatch {
                expected: EvidenceType::FishermanTestEvidence,
                got: self.evidence_type,
            });
        }
        if self.report.servicer_address != self.servicer_address
            || self.leaf.servicer_address != self.servicer_address
        {
            return Err(Error::invalid(
                "qos report",
                "servicer address differs between report, leaf and message",
            ));
        }
        if self.num_of_test_results == 0 {
            return Err(Error::invalid("qos report", "no test results"));
        }
        if self.report.sample_root.range.upper != next_pow2(self.num_of_test_results) {
            return Err(Error::invalid(
                "qos report",
                "sample root range does not match result count",
            ));
        }
        Ok(())
    }
}
