//! Core protocol types for the vipernet relay service
//!
//! Every type that is hashed or signed goes through
//! [`canonical_json`](crate::canonical::canonical_json); field order matters.
//! Fixed-size byte values serialize as lowercase hex strings.

use crate::canonical::canonical_json;
use crate::crypto;
use crate::decimal::Dec;
use crate::error::{Error, Result};
use crate::bloom::BloomFilter;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Version string every AAT must carry.
pub const AAT_VERSION: &str = "0.0.1";

/// Maximum decoded size of a chain or geo-zone identifier.
pub const MAX_NETWORK_ID_BYTES: usize = 4;

// =============================================================================
// FIXED-SIZE BYTE VALUES (hex on the wire)
// =============================================================================

macro_rules! hex_bytes_newtype {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            /// Length in bytes
            pub const LEN: usize = $len;

            /// Decode from a hex string, checking the length.
            pub fn from_hex(s: &str) -> Result<Self> {
                let bytes = hex::decode(s).map_err(|e| Error::InvalidHex(e.to_string()))?;
                Self::from_slice(&bytes)
            }

            /// Copy from a byte slice, checking the length.
            pub fn from_slice(bytes: &[u8]) -> Result<Self> {
                let arr: [u8; $len] = bytes.try_into().map_err(|_| Error::InvalidLength {
                    what: stringify!($name),
                    expected: $len,
                    got: bytes.len(),
                })?;
                Ok(Self(arr))
            }

            /// Lowercase hex encoding
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_bytes_newtype!(
    /// SHA3-256 digest
    Hash32,
    32
);
hex_bytes_newtype!(
    /// Ed25519 public key
    PublicKey,
    32
);
hex_bytes_newtype!(
    /// Ed25519 signature
    Signature,
    64
);
hex_bytes_newtype!(
    /// 20-byte account address: SHA-256(pubkey) truncated
    Address,
    20
);

impl Hash32 {
    /// The all-zero digest used for Merkle padding leaves.
    pub const ZERO: Hash32 = Hash32([0u8; 32]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl Default for Hash32 {
    fn default() -> Self {
        Hash32::ZERO
    }
}

impl PublicKey {
    /// Derive the account address of this key.
    pub fn address(&self) -> Address {
        crypto::address_from_public_key(self)
    }
}

// =============================================================================
// NETWORK IDENTIFIERS
// =============================================================================

macro_rules! network_id_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Validate and wrap a hex identifier of 1..=4 bytes.
            pub fn new(id: impl Into<String>) -> Result<Self> {
                let id = id.into();
                let bytes = hex::decode(&id)
                    .map_err(|_| Error::InvalidNetworkId(format!("{id} is not hex")))?;
                if bytes.is_empty() || bytes.len() > MAX_NETWORK_ID_BYTES {
                    return Err(Error::InvalidNetworkId(format!(
                        "{id} must decode to 1..={MAX_NETWORK_ID_BYTES} bytes"
                    )));
                }
                Ok(Self(id))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;
            fn try_from(value: String) -> Result<Self> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> String {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

network_id_newtype!(
    /// Identifier of a non-native blockchain served by the network
    ChainId
);
network_id_newtype!(
    /// Identifier of a geographic zone servicers stake for
    GeoZoneId
);

// =============================================================================
// SESSIONS
// =============================================================================

/// Uniquely identifies a session. Its hash is the session identity key.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SessionHeader {
    pub requestor_pubkey: PublicKey,
    pub chain: ChainId,
    pub geo_zone: GeoZoneId,
    /// Per-requestor constant fixed at stake time
    pub num_servicers: u32,
    /// First block of the session
    pub session_block_height: u64,
}

impl SessionHeader {
    pub fn validate_basic(&self) -> Result<()> {
        if self.num_servicers == 0 {
            return Err(Error::invalid("session header", "num_servicers must be positive"));
        }
        if self.session_block_height == 0 {
            return Err(Error::invalid(
                "session header",
                "session_block_height must be positive",
            ));
        }
        Ok(())
    }

    /// Canonical bytes of the header
    pub fn bytes(&self) -> Result<Vec<u8>> {
        canonical_json(self)
    }

    /// `SHA3-256(canonical_json(header))`
    pub fn hash(&self) -> Result<Hash32> {
        Ok(crypto::hash(&self.bytes()?))
    }
}

/// A derived session. Never stored durably.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub header: SessionHeader,
    pub session_key: Hash32,
    pub servicers: Vec<Address>,
    pub fishermen: Vec<Address>,
}

impl Session {
    pub fn has_servicer(&self, address: &Address) -> bool {
        self.servicers.contains(address)
    }

    pub fn has_fisherman(&self, address: &Address) -> bool {
        self.fishermen.contains(address)
    }
}

// =============================================================================
// AUTHENTICATION TOKEN
// =============================================================================

/// Requestor authentication token: a requestor authorizing a client key.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Aat {
    pub version: String,
    pub requestor_pubkey: PublicKey,
    pub client_pubkey: PublicKey,
    /// Signature by the requestor over [`Aat::hash`]
    pub requestor_signature: Signature,
}

impl Aat {
    /// `SHA3-256(version || requestor_pubkey || client_pubkey)`
    pub fn hash(&self) -> Hash32 {
        crypto::hash_parts(&[
            self.version.as_bytes(),
            &self.requestor_pubkey.0,
            &self.client_pubkey.0,
        ])
    }

    pub fn validate_basic(&self) -> Result<()> {
        if self.version != AAT_VERSION {
            return Err(Error::invalid(
                "aat",
                format!("unsupported version {}", self.version),
            ));
        }
        Ok(())
    }

    /// Check the requestor signature.
    pub fn verify(&self) -> Result<()> {
        self.validate_basic()?;
        crypto::verify_signature(
            &self.requestor_pubkey,
            &self.hash().0,
            &self.requestor_signature,
        )
    }
}

// =============================================================================
// RELAYS
// =============================================================================

/// Request forwarded to the hosted chain.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayPayload {
    pub data: String,
    pub method: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
}

impl RelayPayload {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.path.is_empty()
    }
}

/// Client-side metadata attached to a relay
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayMeta {
    pub block_height: u64,
}

/// Evidence that a client asked a servicer to perform one relay.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayProof {
    pub entropy: i64,
    pub request_hash: Hash32,
    pub session_block_height: u64,
    pub servicer_pubkey: PublicKey,
    pub chain: ChainId,
    pub geo_zone: GeoZoneId,
    pub num_servicers: u32,
    pub token: Aat,
    /// Client signature over [`RelayProof::hash`]
    pub signature: Signature,
}

/// Signed view of a relay proof. Field order is normative.
#[derive(Serialize)]
struct RelayProofSignable<'a> {
    entropy: i64,
    request_hash: &'a Hash32,
    session_block_height: u64,
    servicer_pubkey: &'a PublicKey,
    chain: &'a ChainId,
    geo_zone: &'a GeoZoneId,
    num_servicers: u32,
    token_hash: Hash32,
}

impl RelayProof {
    /// Canonical bytes with the signature omitted.
    pub fn signable_bytes(&self) -> Result<Vec<u8>> {
        canonical_json(&RelayProofSignable {
            entropy: self.entropy,
            request_hash: &self.request_hash,
            session_block_height: self.session_block_height,
            servicer_pubkey: &self.servicer_pubkey,
            chain: &self.chain,
            geo_zone: &self.geo_zone,
            num_servicers: self.num_servicers,
            token_hash: self.token.hash(),
        })
    }

    /// The digest the client signs.
    pub fn hash(&self) -> Result<Hash32> {
        Ok(crypto::hash(&self.signable_bytes()?))
    }

    /// Identity used for duplicate detection: `SHA3(entropy_le || request_hash)`.
    pub fn unique_key(&self) -> Hash32 {
        crypto::hash_parts(&[&self.entropy.to_le_bytes(), &self.request_hash.0])
    }

    /// The session this proof claims to belong to.
    pub fn session_header(&self) -> SessionHeader {
        SessionHeader {
            requestor_pubkey: self.token.requestor_pubkey,
            chain: self.chain.clone(),
            geo_zone: self.geo_zone.clone(),
            num_servicers: self.num_servicers,
            session_block_height: self.session_block_height,
        }
    }

    /// Verify the client signature against the key the token authorizes.
    pub fn verify_client_signature(&self) -> Result<()> {
        crypto::verify_signature(&self.token.client_pubkey, &self.hash()?.0, &self.signature)
    }
}

/// Inbound relay: `POST /v1/client/relay`
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Relay {
    pub payload: RelayPayload,
    pub meta: RelayMeta,
    pub proof: RelayProof,
}

/// Hashed view of a relay request. Field order is normative.
#[derive(Serialize)]
struct RelayRequestHashable<'a> {
    payload: &'a RelayPayload,
    meta: &'a RelayMeta,
}

impl Relay {
    /// `SHA3-256(canonical_json({payload, meta}))`
    pub fn request_hash(&self) -> Result<Hash32> {
        compute_request_hash(&self.payload, &self.meta)
    }
}

/// Compute the request hash a client commits to in its proof.
pub fn compute_request_hash(payload: &RelayPayload, meta: &RelayMeta) -> Result<Hash32> {
    let bytes = canonical_json(&RelayRequestHashable { payload, meta })?;
    Ok(crypto::hash(&bytes))
}

/// Servicer answer to a relay
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayResponse {
    /// Servicer signature over `SHA3(response || proof_hash)`
    pub signature: Signature,
    pub response: String,
    pub proof: RelayProof,
}

impl RelayResponse {
    /// Digest the servicer signs.
    pub fn sign_hash(response: &str, proof: &RelayProof) -> Result<Hash32> {
        let proof_hash = proof.hash()?;
        Ok(crypto::hash_parts(&[response.as_bytes(), &proof_hash.0]))
    }

    /// Verify the servicer signature.
    pub fn verify(&self) -> Result<()> {
        let digest = Self::sign_hash(&self.response, &self.proof)?;
        crypto::verify_signature(&self.proof.servicer_pubkey, &digest.0, &self.signature)
    }
}

// =============================================================================
// CHALLENGES
// =============================================================================

/// Report that one servicer answered differently from a majority.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChallengeProofInvalidData {
    pub majority_responses: Vec<RelayResponse>,
    pub minority_response: RelayResponse,
    pub reporter_address: Address,
}

impl ChallengeProofInvalidData {
    /// Identity used for duplicate detection: the minority proof.
    pub fn unique_key(&self) -> Result<Hash32> {
        let proof_bytes = canonical_json(&self.minority_response.proof)?;
        Ok(crypto::hash_parts(&[b"challenge", &proof_bytes]))
    }

    /// The session every response must belong to.
    pub fn session_header(&self) -> SessionHeader {
        self.minority_response.proof.session_header()
    }
}

/// Signed acknowledgement for an accepted challenge
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChallengeResponse {
    pub response: String,
    pub servicer_pubkey: PublicKey,
    pub signature: Signature,
}

// =============================================================================
// PROOFS (closed variant set)
// =============================================================================

/// Evidence variants
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum EvidenceType {
    RelayEvidence = 1,
    ChallengeEvidence = 2,
    FishermanTestEvidence = 3,
}

impl EvidenceType {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A leaf of relay or challenge evidence.
///
/// Wire names double as the codec registry: `vipernet/RelayProof` and
/// `vipernet/ChallengeProof`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Proof {
    #[serde(rename = "vipernet/RelayProof")]
    Relay(RelayProof),
    #[serde(rename = "vipernet/ChallengeProof")]
    Challenge(ChallengeProofInvalidData),
}

impl Proof {
    pub const RELAY_TYPE_URL: &'static str = "vipernet/RelayProof";
    pub const CHALLENGE_TYPE_URL: &'static str = "vipernet/ChallengeProof";

    /// Registered wire-type string of this variant.
    pub fn type_url(&self) -> &'static str {
        match self {
            Proof::Relay(_) => Self::RELAY_TYPE_URL,
            Proof::Challenge(_) => Self::CHALLENGE_TYPE_URL,
        }
    }

    /// Decode a proof from its wire-type string and JSON body.
    pub fn from_type_url(type_url: &str, value: serde_json::Value) -> Result<Self> {
        match type_url {
            Self::RELAY_TYPE_URL => Ok(Proof::Relay(serde_json::from_value(value)?)),
            Self::CHALLENGE_TYPE_URL => Ok(Proof::Challenge(serde_json::from_value(value)?)),
            other => Err(Error::invalid("proof", format!("unregistered type {other}"))),
        }
    }

    pub fn evidence_type(&self) -> EvidenceType {
        match self {
            Proof::Relay(_) => EvidenceType::RelayEvidence,
            Proof::Challenge(_) => EvidenceType::ChallengeEvidence,
        }
    }

    pub fn unique_key(&self) -> Result<Hash32> {
        match self {
            Proof::Relay(p) => Ok(p.unique_key()),
            Proof::Challenge(c) => c.unique_key(),
        }
    }

    pub fn session_header(&self) -> SessionHeader {
        match self {
            Proof::Relay(p) => p.session_header(),
            Proof::Challenge(c) => c.session_header(),
        }
    }
}

// =============================================================================
// EVIDENCE
// =============================================================================

/// Per-servicer, per-session, per-type proof store.
///
/// Append-only until sealed; sealed evidence is frozen.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Evidence {
    pub header: SessionHeader,
    pub servicer: Address,
    pub evidence_type: EvidenceType,
    pub proofs: Vec<Proof>,
    pub num_proofs: u64,
    pub bloom: BloomFilter,
    pub sealed: bool,
}

impl Evidence {
    pub fn new(header: SessionHeader, servicer: Address, evidence_type: EvidenceType) -> Self {
        Self {
            header,
            servicer,
            evidence_type,
            proofs: Vec::new(),
            num_proofs: 0,
            bloom: BloomFilter::default(),
            sealed: false,
        }
    }

    /// Cache key of this evidence.
    pub fn key(&self) -> Result<Hash32> {
        crypto::evidence_key(&self.header, self.evidence_type, &self.servicer)
    }

    /// True iff the proof's identity is not already present.
    ///
    /// The bloom filter short-circuits the common case; a positive is
    /// confirmed against the stored proofs.
    pub fn is_unique(&self, proof: &Proof) -> Result<bool> {
        let key = proof.unique_key()?;
        if !self.bloom.contains(&key.0) {
            return Ok(true);
        }
        for stored in &self.proofs {
            if stored.unique_key()? == key {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Append a proof, enforcing sealing, type and uniqueness.
    pub fn push(&mut self, proof: Proof) -> Result<u64> {
        if self.sealed {
            return Err(Error::SealedEvidence);
        }
        if proof.evidence_type() != self.evidence_type {
            return Err(Error::EvidenceTypeMismatch {
                expected: self.evidence_type,
                got: proof.evidence_type(),
            });
        }
        if !self.is_unique(&proof)? {
            return Err(Error::DuplicateProof);
        }
        let key = proof.unique_key()?;
        self.bloom.insert(&key.0);
        self.proofs.push(proof);
        self.num_proofs = self.proofs.len() as u64;
        Ok(self.num_proofs)
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }
}

/// One fisherman sample of one servicer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestResult {
    pub servicer_address: Address,
    /// Unix time in milliseconds
    pub timestamp_ms: u64,
    pub latency: Duration,
    pub is_available: bool,
    pub is_reliable: bool,
}

/// Fisherman counterpart of [`Evidence`]: the samples of one servicer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FishermanResult {
    pub header: SessionHeader,
    pub servicer_address: Address,
    pub test_results: Vec<TestResult>,
    pub num_test_results: u64,
    pub evidence_type: EvidenceType,
    pub sealed: bool,
    /// Lowest average latency among the session's sampled servicers,
    /// fixed when the session's result sets are sealed together.
    #[serde(default)]
    pub session_fastest: Option<Duration>,
}

impl FishermanResult {
    pub fn new(header: SessionHeader, servicer_address: Address) -> Self {
        Self {
            header,
            servicer_address,
            test_results: Vec::new(),
            num_test_results: 0,
            evidence_type: EvidenceType::FishermanTestEvidence,
            sealed: false,
            session_fastest: None,
        }
    }

    pub fn key(&self) -> Result<Hash32> {
        crypto::evidence_key(&self.header, self.evidence_type, &self.servicer_address)
    }

    pub fn push(&mut self, result: TestResult) -> Result<u64> {
        if self.sealed {
            return Err(Error::SealedEvidence);
        }
        if result.servicer_address != self.servicer_address {
            return Err(Error::invalid(
                "test result",
                "servicer address does not match result set",
            ));
        }
        self.test_results.push(result);
        self.num_test_results = self.test_results.len() as u64;
        Ok(self.num_test_results)
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Seal with the session-wide fastest latency used for scoring.
    pub fn seal_scored(&mut self, session_fastest: Option<Duration>) {
        self.session_fastest = session_fastest;
        self.sealed = true;
    }
}

// =============================================================================
// MERKLE VALUES
// =============================================================================

/// Half-open leaf interval `[lower, upper)` covered by a Merkle node
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Range {
    pub lower: u64,
    pub upper: u64,
}

impl Range {
    pub fn width(&self) -> u64 {
        self.upper.saturating_sub(self.lower)
    }
}

/// A Merkle node: digest plus the leaf range it covers
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct HashRange {
    pub hash: Hash32,
    pub range: Range,
}

/// Sibling path for one leaf
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MerkleProof {
    /// Position of the target among the sorted leaves
    pub target_index: u64,
    pub hash_ranges: Vec<HashRange>,
    pub target: HashRange,
}

// =============================================================================
// QOS
// =============================================================================

/// QoS scores in `[0, 1]`
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QosScores {
    pub latency: Dec,
    pub availability: Dec,
    pub reliability: Dec,
}

impl QosScores {
    /// Every score at the given value.
    pub fn uniform(value: Dec) -> Self {
        Self {
            latency: value,
            availability: value,
            reliability: value,
        }
    }
}

/// Cumulative on-chain QoS record of a validator
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportCard {
    pub total_sessions: u64,
    pub total_latency_score: Dec,
    pub total_availability_score: Dec,
    pub total_reliability_score: Dec,
}

impl ReportCard {
    /// Fold in one session's scores.
    pub fn apply(&mut self, scores: &QosScores) -> Result<()> {
        self.total_latency_score = self.total_latency_score.checked_add(scores.latency)?;
        self.total_availability_score = self
            .total_availability_score
            .checked_add(scores.availability)?;
        self.total_reliability_score = self
            .total_reliability_score
            .checked_add(scores.reliability)?;
        self.total_sessions += 1;
        Ok(())
    }

    /// Per-session average, if any session has been reported.
    pub fn average(&self) -> Option<QosScores> {
        if self.total_sessions == 0 {
            return None;
        }
        let n = self.total_sessions as u128;
        Some(QosScores {
            latency: self.total_latency_score.div_int(n),
            availability: self.total_availability_score.div_int(n),
            reliability: self.total_reliability_score.div_int(n),
        })
    }
}

// =============================================================================
// ON-CHAIN ACTORS
// =============================================================================

/// Validator as seen through the staking interface
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Validator {
    pub address: Address,
    pub pubkey: PublicKey,
    pub service_url: String,
    pub chains: Vec<ChainId>,
    pub geo_zones: Vec<GeoZoneId>,
    pub staked: bool,
    pub jailed: bool,
    pub paused: bool,
    pub report_card: ReportCard,
}

impl Validator {
    /// Staked and neither jailed nor paused
    pub fn is_active(&self) -> bool {
        self.staked && !self.jailed && !self.paused
    }

    pub fn serves_chain(&self, chain: &ChainId) -> bool {
        self.chains.contains(chain)
    }

    pub fn serves_geo_zone(&self, geo_zone: &GeoZoneId) -> bool {
        self.geo_zones.contains(geo_zone)
    }
}

/// Application buying relays, as seen through the requestor interface
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Requestor {
    pub address: Address,
    pub pubkey: PublicKey,
    pub chains: Vec<ChainId>,
    pub geo_zones: Vec<GeoZoneId>,
    /// Derived from stake; not recomputed per session
    pub max_relays: u64,
    pub num_servicers: u32,
    pub staked: bool,
}

impl Requestor {
    /// `floor(max_relays / len(chains) / num_servicers)`
    pub fn max_possible_relays(&self) -> u64 {
        if self.chains.is_empty() || self.num_servicers == 0 {
            return 0;
        }
        self.max_relays / self.chains.len() as u64 / self.num_servicers as u64
    }
}

/// Governance parameters of the relay service
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolParams {
    pub blocks_per_session: u64,
    /// Sessions between claim and the reveal height
    pub claim_submission_window: u64,
    /// Sessions a claim stays valid
    pub claim_expiration: u64,
    pub minimum_number_of_proofs: u64,
    pub replay_attack_burn_multiplier: u64,
    /// Sessions after session end a QoS report may be submitted
    pub report_card_submission_window: u64,
    pub minimum_sample_relays: u64,
    pub fisherman_count: u32,
}

impl Default for ProtocolParams {
    fn default() -> Self {
        Self {
            blocks_per_session: 4,
            claim_submission_window: 3,
            claim_expiration: 24,
            minimum_number_of_proofs: 10,
            replay_attack_burn_multiplier: 3,
            report_card_submission_window: 3,
            minimum_sample_relays: 25,
            fisherman_count: 1,
        }
    }
}

impl ProtocolParams {
    /// First block of the session containing `height`.
    pub fn session_start(&self, height: u64) -> u64 {
        session_start(height, self.blocks_per_session)
    }

    /// Last block of the session starting at `session_block_height`.
    pub fn session_end(&self, session_block_height: u64) -> u64 {
        session_block_height + self.blocks_per_session.saturating_sub(1)
    }
}

/// First block of the session containing `height` (sessions start at 1).
pub fn session_start(height: u64, blocks_per_session: u64) -> u64 {
    if height == 0 || blocks_per_session == 0 {
        return 1;
    }
    (height - 1) / blocks_per_session * blocks_per_session + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_id_bounds() {
        assert!(ChainId::new("0001").is_ok());
        assert!(ChainId::new("01").is_ok());
        assert!(ChainId::new("").is_err());
        assert!(ChainId::new("0102030405").is_err());
        assert!(GeoZoneId::new("zz").is_err());
    }

    #[test]
    fn test_network_id_rejected_on_decode() {
        let parsed: std::result::Result<ChainId, _> = serde_json::from_str("\"0102030405\"");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_hex_newtype_lengths() {
        assert!(Address::from_hex(&"ab".repeat(20)).is_ok());
        assert!(Address::from_hex(&"ab".repeat(21)).is_err());
        assert!(Signature::from_slice(&[0u8; 63]).is_err());
        assert!(PublicKey::from_hex("not-hex").is_err());
    }

    #[test]
    fn test_session_start() {
        assert_eq!(session_start(1, 4), 1);
        assert_eq!(session_start(4, 4), 1);
        assert_eq!(session_start(5, 4), 5);
        assert_eq!(session_start(12, 4), 9);
        assert_eq!(session_start(13, 4), 13);
    }

    #[test]
    fn test_max_possible_relays() {
        let requestor = Requestor {
            address: Address([1; 20]),
            pubkey: PublicKey([1; 32]),
            chains: vec![ChainId::new("0001").unwrap()],
            geo_zones: vec![GeoZoneId::new("0001").unwrap()],
            max_relays: 10_000_000,
            num_servicers: 5,
            staked: true,
        };
        assert_eq!(requestor.max_possible_relays(), 2_000_000);
    }

    #[test]
    fn test_report_card_average() {
        let mut card = ReportCard::default();
        assert!(card.average().is_none());
        card.apply(&QosScores::uniform(Dec::one())).unwrap();
        card.apply(&QosScores::uniform(Dec::zero())).unwrap();
        let avg = card.average().unwrap();
        assert_eq!(avg.availability, Dec::from_ratio(1, 2).unwrap());
    }

    #[test]
    fn test_proof_type_registry() {
        let value = serde_json::json!({"bogus": true});
        assert!(Proof::from_type_url("vipernet/Unknown", value).is_err());
    }
}
