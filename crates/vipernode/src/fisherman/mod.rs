//! Fisherman: sample session servicers and record test results
//!
//! A trigger names a session through one of its relay proofs. The first
//! local identity that is a fisherman of that session spawns one sampler
//! task; repeated triggers for the same (session, fisherman) are
//! acknowledged without spawning another.

mod availability;
mod pool;
mod sampler;

pub use availability::{AvailabilityMonitor, AVAILABILITY_WINDOW};
pub use pool::{PoolError, SamplePool};
pub use sampler::{build_probe_relay, Sampler, SamplerSummary, SamplerTiming};

use crate::error::ViperError;
use crate::runtime::Runtime;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use vipernet_core::{Address, RelayProof};

/// Answer to `POST /v1/fisherman/trigger`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerAck {
    pub fisherman: Address,
    pub session_block_height: u64,
    /// False when a sampler for this session was already running
    pub started: bool,
}

impl Runtime {
    /// Start sampling the session `proof` belongs to.
    pub async fn trigger_fisherman(
        self: &Arc<Self>,
        proof: RelayProof,
    ) -> Result<TriggerAck, ViperError> {
        let header = proof.session_header();
        header.validate_basic()?;
        let height = self.current_height().await?;
        let params = self.chain().staking.params(height).await?;
        let session_end = params.session_end(header.session_block_height);
        if height > session_end {
            return Err(ViperError::InvalidSession(format!(
                "session {} ended at height {session_end}",
                header.session_block_height
            )));
        }

        let local_chain = self
            .hosted_chains()
            .get(&header.chain)
            .cloned()
            .ok_or_else(|| ViperError::UnsupportedBlockchain(header.chain.clone()))?;
        let payloads = self.sample_pool().payloads(&header.chain).to_vec();
        if payloads.is_empty() {
            return Err(ViperError::InvalidRequest(format!(
                "no sample payloads configured for chain {}",
                header.chain
            )));
        }

        let mut chosen = None;
        for node in self.nodes() {
            let session = node
                .sessions
                .get_or_derive(self.chain(), &header, height)
                .await?;
            if session.has_fisherman(&node.address()) {
                chosen = Some((node.clone(), session));
                break;
            }
        }
        let Some((node, session)) = chosen else {
            return Err(ViperError::InvalidSession(
                "no local identity is a fisherman of this session".into(),
            ));
        };

        let key = (header.hash()?, node.address());
        if !self.samplers.lock().insert(key) {
            debug!(fisherman = %node.address(), "sampler already running");
            return Ok(TriggerAck {
                fisherman: node.address(),
                session_block_height: header.session_block_height,
                started: false,
            });
        }

        let sampler = Sampler {
            chain: self.chain().clone(),
            upstream: self.upstream().clone(),
            local_chain,
            payloads,
            node: node.clone(),
            session,
            session_end,
            timing: self.settings().sampler_timing,
            metrics: self.metrics().clone(),
            heights: self.subscribe_height(),
        };
        info!(
            fisherman = %node.address(),
            chain = %header.chain,
            session = header.session_block_height,
            "fisherman triggered"
        );
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            sampler.run().await;
            runtime.samplers.lock().remove(&key);
        });

        Ok(TriggerAck {
            fisherman: node.address(),
            session_block_height: header.session_block_height,
            started: true,
        })
    }
}
