//! RPC-boundary errors with stable codes
//!
//! Every error leaving the node carries a numeric code from [`ErrorCode`]
//! and the codespace `"vipernet"`. Codes never change between versions.

use crate::cache::CacheError;
use crate::claims::ClaimError;
use crate::interfaces::ChainError;
use crate::reports::ReportError;
use crate::session::SessionError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vipernet_core::{Address, ChainId};
use vipernet_net::UpstreamError;

/// Codespace of every vipernet error
pub const CODESPACE: &str = "vipernet";

/// Stable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ErrorCode {
    Internal = 1,
    EmptyPayload = 2,
    InvalidBlockHeight = 3,
    InvalidSession = 4,
    UnsupportedBlockchain = 5,
    RequestHashMismatch = 6,
    InvalidSignature = 7,
    InvalidRequest = 8,
    UnknownNode = 9,
    RequestorNotFound = 10,
    InvalidChallenge = 11,
    OverService = 20,
    DuplicateProof = 21,
    SealedEvidence = 22,
    NodeNotInSession = 23,
    InsufficientServicers = 24,
    InvalidClaimMerkleVerify = 30,
    ReplayAttack = 31,
    InvalidProofs = 32,
    InvalidClaim = 33,
    ClaimNotFound = 34,
    UpstreamFailure = 40,
    StorageFailure = 41,
}

/// How an error is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Client fault; no local side effect
    Validation,
    /// Servicer state; caller should re-dispatch
    Business,
    /// Fatal for the current evidence
    Protocol,
    /// Retried locally, surfaced as internal on persistent failure
    Infrastructure,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn category(self) -> ErrorCategory {
        match self.as_u32() {
            1 | 40 | 41 => ErrorCategory::Infrastructure,
            2..=19 => ErrorCategory::Validation,
            20..=29 => ErrorCategory::Business,
            _ => ErrorCategory::Protocol,
        }
    }

    /// Protocol errors after which local evidence is dropped.
    pub fn deletes_evidence(self) -> bool {
        matches!(
            self,
            ErrorCode::InvalidClaimMerkleVerify | ErrorCode::ReplayAttack | ErrorCode::InvalidProofs
        )
    }

    pub fn http_status(self) -> StatusCode {
        match self.category() {
            ErrorCategory::Infrastructure => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Error surfaced at the RPC boundary
#[derive(Debug, Error)]
pub enum ViperError {
    #[error("relay payload is empty")]
    EmptyPayload,

    #[error("block height {got} is outside the allowed range {min}..={max}")]
    InvalidBlockHeight { got: u64, min: u64, max: u64 },

    #[error("invalid session: {0}")]
    InvalidSession(String),

    #[error("blockchain {0} is not hosted by this node")]
    UnsupportedBlockchain(ChainId),

    #[error("request hash does not match the relay payload")]
    RequestHashMismatch,

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no local node for servicer {0}")]
    UnknownNode(String),

    #[error("requestor rejected: {0}")]
    Requestor(String),

    #[error("invalid challenge: {0}")]
    InvalidChallenge(String),

    #[error("node {0} is not part of the session")]
    NodeNotInSession(Address),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Claim(#[from] ClaimError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("upstream failure: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ViperError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ViperError::EmptyPayload => ErrorCode::EmptyPayload,
            ViperError::InvalidBlockHeight { .. } => ErrorCode::InvalidBlockHeight,
            ViperError::InvalidSession(_) => ErrorCode::InvalidSession,
            ViperError::UnsupportedBlockchain(_) => ErrorCode::UnsupportedBlockchain,
            ViperError::RequestHashMismatch => ErrorCode::RequestHashMismatch,
            ViperError::InvalidSignature(_) => ErrorCode::InvalidSignature,
            ViperError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            ViperError::UnknownNode(_) => ErrorCode::UnknownNode,
            ViperError::Requestor(_) => ErrorCode::RequestorNotFound,
            ViperError::InvalidChallenge(_) => ErrorCode::InvalidChallenge,
            ViperError::NodeNotInSession(_) => ErrorCode::NodeNotInSession,
            ViperError::Session(e) => e.code(),
            ViperError::Cache(e) => e.code(),
            ViperError::Claim(e) => e.code(),
            ViperError::Report(e) => e.code(),
            ViperError::Chain(e) => e.code(),
            ViperError::Upstream(_) => ErrorCode::UpstreamFailure,
            ViperError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Wire body of this error
    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: ErrorDetail {
                code: self.code().as_u32(),
                codespace: CODESPACE.to_string(),
                message: self.to_string(),
            },
        }
    }
}

impl From<vipernet_core::Error> for ViperError {
    fn from(e: vipernet_core::Error) -> Self {
        use vipernet_core::Error as Core;
        match e {
            Core::InvalidSignature | Core::InvalidPublicKey(_) => {
                ViperError::InvalidSignature(e.to_string())
            }
            Core::Serialization(_) | Core::Json(_) | Core::Decimal(_) | Core::Merkle(_) => {
                ViperError::Internal(e.to_string())
            }
            other => ViperError::InvalidRequest(other.to_string()),
        }
    }
}

/// `{"error": {...}}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorDetail {
    pub code: u32,
    pub codespace: String,
    pub message: String,
}

impl IntoResponse for ViperError {
    fn into_response(self) -> Response {
        (self.code().http_status(), Json(self.body())).into_response()
    }
}
