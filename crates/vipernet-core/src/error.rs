//! Error types for vipernet core

use crate::merkle::MerkleError;
use thiserror::Error;

/// Result type alias using our Error
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// vipernet core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Binary (storage) serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// JSON (canonical) serialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Hex decoding failed
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    /// Fixed-size value had the wrong length
    #[error("invalid {what} length: expected {expected} bytes, got {got}")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// Chain or geo-zone identifier is not 1..=4 hex bytes
    #[error("invalid network identifier: {0}")]
    InvalidNetworkId(String),

    /// Invalid signature
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid public key
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Bech32 address could not be decoded
    #[error("invalid bech32 address: {0}")]
    InvalidBech32(String),

    /// Structural check failed on a message or token
    #[error("invalid {what}: {reason}")]
    Invalid { what: &'static str, reason: String },

    /// Evidence or result set is sealed and cannot accept new entries
    #[error("evidence is sealed")]
    SealedEvidence,

    /// The (entropy, request hash) pair is already present
    #[error("duplicate proof")]
    DuplicateProof,

    /// A proof of one evidence type was offered to evidence of another
    #[error("evidence type mismatch: expected {expected:?}, got {got:?}")]
    EvidenceTypeMismatch {
        expected: crate::types::EvidenceType,
        got: crate::types::EvidenceType,
    },

    /// Fixed-point decimal parse or arithmetic failure
    #[error("decimal error: {0}")]
    Decimal(String),

    /// Merkle construction or verification failure
    #[error("merkle error: {0}")]
    Merkle(#[from] MerkleError),
}

impl Error {
    pub(crate) fn invalid(what: &'static str, reason: impl Into<String>) -> Self {
        Error::Invalid {
            what,
            reason: reason.into(),
        }
    }
}
