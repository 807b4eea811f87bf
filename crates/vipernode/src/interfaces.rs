//! Capability interfaces to the external chain
//!
//! The node never reaches into consensus or staking state directly. Each
//! concern is a narrow async trait injected at construction; queries take
//! the height they are evaluated at (snapshot semantics).

use crate::error::ErrorCode;
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use vipernet_core::msgs::{MsgClaim, MsgProof, MsgSubmitQosReport};
use vipernet_core::*;

/// Errors returned by chain interfaces
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("block {0} not found")]
    BlockNotFound(u64),
    #[error("validator {0} not found")]
    ValidatorNotFound(Address),
    #[error("requestor {0} not found")]
    RequestorNotFound(Address),
    #[error("insufficient funds for {address}: need {needed}, have {available}")]
    InsufficientFunds {
        address: Address,
        needed: u64,
        available: u64,
    },
    /// The chain refused a message with a stable error code.
    #[error("rejected by chain ({code:?}): {reason}")]
    Rejected { code: ErrorCode, reason: String },
    #[error("chain unavailable: {0}")]
    Unavailable(String),
}

impl ChainError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ChainError::RequestorNotFound(_) => ErrorCode::RequestorNotFound,
            ChainError::Rejected { code, .. } => *code,
            _ => ErrorCode::Internal,
        }
    }

    /// Worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Unavailable(_) | ChainError::BlockNotFound(_))
    }
}

/// Retry a chain call with exponential backoff while it fails transiently.
///
/// Permanent errors and the last transient error after `max_elapsed` are
/// returned unchanged.
pub async fn retry_transient<T, F, Fut>(max_elapsed: Duration, mut op: F) -> Result<T, ChainError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChainError>>,
{
    let backoff = ExponentialBackoff {
        initial_interval: Duration::from_millis(50),
        max_interval: Duration::from_secs(1),
        max_elapsed_time: Some(max_elapsed),
        ..Default::default()
    };
    backoff::future::retry(backoff, || {
        let call = op();
        async move {
            call.await.map_err(|e| {
                if e.is_transient() {
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        }
    })
    .await
}

/// Block height and hash source
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn current_height(&self) -> Result<u64, ChainError>;

    async fn block_hash(&self, height: u64) -> Result<Hash32, ChainError>;
}

/// Staking / validator module
#[async_trait]
pub trait Staking: Send + Sync {
    async fn params(&self, height: u64) -> Result<ProtocolParams, ChainError>;

    async fn validators_by_chain(
        &self,
        height: u64,
        chain: &ChainId,
    ) -> Result<Vec<Address>, ChainError>;

    async fn validators_by_geo_zone(
        &self,
        height: u64,
        geo_zone: &GeoZoneId,
    ) -> Result<Vec<Address>, ChainError>;

    async fn get_validator(&self, height: u64, address: &Address)
        -> Result<Validator, ChainError>;

    async fn reward_for_relays(
        &self,
        report_card: &ReportCard,
        num_relays: u64,
        servicer: &Address,
        requestor: &Address,
    ) -> Result<u64, ChainError>;

    async fn burn_for_challenge(&self, servicer: &Address) -> Result<(), ChainError>;

    async fn pause_node(&self, address: &Address) -> Result<(), ChainError>;

    async fn slash_fisherman(&self, address: &Address) -> Result<(), ChainError>;

    async fn burn_for_no_activity(&self, address: &Address) -> Result<(), ChainError>;

    /// Fold one session's scores into a report card. Idempotent per
    /// (session, servicer).
    async fn update_validator_report_card(
        &self,
        header: &SessionHeader,
        address: &Address,
        scores: &QosScores,
    ) -> Result<(), ChainError>;
}

/// Requestor / application module
#[async_trait]
pub trait Requestors: Send + Sync {
    async fn get_requestor(&self, height: u64, address: &Address)
        -> Result<Requestor, ChainError>;
}

/// Message submission
#[async_trait]
pub trait ChainTx: Send + Sync {
    async fn submit_claim(&self, signer: &Address, msg: MsgClaim) -> Result<(), ChainError>;

    async fn submit_proof(&self, signer: &Address, msg: MsgProof) -> Result<(), ChainError>;

    async fn submit_qos_report(
        &self,
        signer: &Address,
        msg: MsgSubmitQosReport,
    ) -> Result<(), ChainError>;

    async fn get_claim(
        &self,
        from: &Address,
        header: &SessionHeader,
        evidence_type: EvidenceType,
    ) -> Result<Option<MsgClaim>, ChainError>;

    async fn get_qos_report(
        &self,
        header: &SessionHeader,
        servicer: &Address,
    ) -> Result<Option<MsgSubmitQosReport>, ChainError>;
}

/// Every chain capability the node consumes
#[derive(Clone)]
pub struct ChainHandles {
    pub blocks: Arc<dyn BlockSource>,
    pub staking: Arc<dyn Staking>,
    pub requestors: Arc<dyn Requestors>,
    pub tx: Arc<dyn ChainTx>,
}

impl ChainHandles {
    /// Wire all capabilities to one implementation.
    pub fn from_single<C>(chain: Arc<C>) -> Self
    where
        C: BlockSource + Staking + Requestors + ChainTx + 'static,
    {
        Self {
            blocks: chain.clone(),
            staking: chain.clone(),
            requestors: chain.clone(),
            tx: chain,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let out = retry_transient(Duration::from_secs(2), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ChainError::Unavailable("busy".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 2);
    }

    #[tokio::test]
    async fn test_retry_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let err = retry_transient(Duration::from_secs(2), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<(), _>(ChainError::Rejected {
                    code: ErrorCode::InvalidClaim,
                    reason: "no".into(),
                })
            }
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidClaim);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
