//! Process-wide owner of every node identity, cache and engine
//!
//! One `Runtime` is built at startup and shared behind an `Arc`. In lean
//! mode it hosts several identities; inbound requests are routed by the
//! servicer public key they name.

use crate::claims::ClaimEngine;
use crate::error::ViperError;
use crate::fisherman::{SamplePool, SamplerTiming};
use crate::interfaces::ChainHandles;
use crate::metrics::Metrics;
use crate::node::ViperNode;
use crate::reports::ReportEngine;
use crate::session::SessionCache;
use crate::storage::Storage;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vipernet_core::{Address, Hash32, PublicKey, Session, SessionHeader};
use vipernet_net::{HostedChains, KeyPair, UpstreamClient, UpstreamError};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("at least one node identity is required")]
    NoIdentities,
    #[error("identity {0} configured twice")]
    DuplicateIdentity(Address),
    #[error(transparent)]
    Cache(#[from] crate::cache::CacheError),
    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),
    #[error("metrics registry: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

/// Node-local tuning knobs
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Blocks a client's height may differ from ours
    pub client_block_sync_allowance: u64,
    /// Sessions a proof may lag behind the latest session boundary
    pub client_session_sync_allowance: u64,
    pub rpc_timeout: Duration,
    /// Time box of one claim/report scan
    pub claim_scan_budget: Duration,
    /// Blocks after session end a derived session stays cached
    pub session_cache_max_age_blocks: u64,
    /// Bound on backoff retries of chain lookups and submissions
    pub chain_retry_window: Duration,
    pub sampler_timing: SamplerTiming,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            client_block_sync_allowance: 10,
            client_session_sync_allowance: 1,
            rpc_timeout: Duration::from_millis(3000),
            claim_scan_budget: Duration::from_millis(500),
            session_cache_max_age_blocks: 8,
            chain_retry_window: Duration::from_secs(5),
            sampler_timing: SamplerTiming::default(),
        }
    }
}

/// Everything the node owns
pub struct Runtime {
    settings: RuntimeSettings,
    chain: ChainHandles,
    chains: Arc<HostedChains>,
    pool: Arc<SamplePool>,
    upstream: UpstreamClient,
    storage: Storage,
    nodes: BTreeMap<Address, Arc<ViperNode>>,
    by_pubkey: HashMap<PublicKey, Address>,
    /// Sessions derived for dispatch requests
    dispatch_sessions: SessionCache,
    metrics: Metrics,
    claims: ClaimEngine,
    reports: ReportEngine,
    height_tx: watch::Sender<u64>,
    /// Running samplers by (session header hash, fisherman)
    pub(crate) samplers: Mutex<HashSet<(Hash32, Address)>>,
}

impl Runtime {
    pub fn new(
        settings: RuntimeSettings,
        chain: ChainHandles,
        chains: HostedChains,
        pool: SamplePool,
        storage: Storage,
        keypairs: Vec<KeyPair>,
    ) -> Result<Self, RuntimeError> {
        if keypairs.is_empty() {
            return Err(RuntimeError::NoIdentities);
        }
        let mut nodes = BTreeMap::new();
        let mut by_pubkey = HashMap::new();
        for keypair in keypairs {
            let address = keypair.address();
            let pubkey = keypair.public_key();
            if nodes.contains_key(&address) {
                return Err(RuntimeError::DuplicateIdentity(address));
            }
            nodes.insert(address, Arc::new(ViperNode::open(&storage, keypair)?));
            by_pubkey.insert(pubkey, address);
        }

        let metrics = Metrics::new()?;
        let upstream = UpstreamClient::new(settings.rpc_timeout)?;
        let claims = ClaimEngine::new(chain.clone(), metrics.clone(), settings.chain_retry_window);
        let reports = ReportEngine::new(chain.clone(), metrics.clone(), settings.chain_retry_window);
        let (height_tx, _) = watch::channel(0);

        info!(
            identities = nodes.len(),
            chains = chains.len(),
            sample_chains = pool.len(),
            "runtime initialized"
        );

        Ok(Self {
            settings,
            chain,
            chains: Arc::new(chains),
            pool: Arc::new(pool),
            upstream,
            storage,
            nodes,
            by_pubkey,
            dispatch_sessions: SessionCache::new(),
            metrics,
            claims,
            reports,
            height_tx,
            samplers: Mutex::new(HashSet::new()),
        })
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn chain(&self) -> &ChainHandles {
        &self.chain
    }

    pub fn hosted_chains(&self) -> &HostedChains {
        &self.chains
    }

    pub fn sample_pool(&self) -> &SamplePool {
        &self.pool
    }

    pub fn upstream(&self) -> &UpstreamClient {
        &self.upstream
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn dispatch_sessions(&self) -> &SessionCache {
        &self.dispatch_sessions
    }

    /// Local identities in address order
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<ViperNode>> {
        self.nodes.values()
    }

    pub fn node(&self, address: &Address) -> Option<Arc<ViperNode>> {
        self.nodes.get(address).cloned()
    }

    /// Route by servicer public key; unknown keys fail fast.
    pub fn node_by_pubkey(&self, pubkey: &PublicKey) -> Result<Arc<ViperNode>, ViperError> {
        self.by_pubkey
            .get(pubkey)
            .and_then(|a| self.nodes.get(a))
            .cloned()
            .ok_or_else(|| ViperError::UnknownNode(pubkey.to_hex()))
    }

    /// Highest block height observed so far
    pub fn height(&self) -> u64 {
        *self.height_tx.borrow()
    }

    pub fn subscribe_height(&self) -> watch::Receiver<u64> {
        self.height_tx.subscribe()
    }

    /// Publish a new height to subscribers. Stale heights are ignored.
    pub fn observe_height(&self, height: u64) -> bool {
        self.height_tx.send_if_modified(|current| {
            if height > *current {
                *current = height;
                true
            } else {
                false
            }
        })
    }

    /// Current chain height, also published to subscribers.
    pub async fn current_height(&self) -> Result<u64, ViperError> {
        let height = self.chain.blocks.current_height().await?;
        self.observe_height(height);
        Ok(height)
    }

    /// `POST /v1/client/dispatch`: derive the session a header names.
    pub async fn dispatch(&self, header: SessionHeader) -> Result<Arc<Session>, ViperError> {
        header.validate_basic()?;
        let height = self.current_height().await?;
        if header.session_block_height > height {
            return Err(ViperError::InvalidBlockHeight {
                got: header.session_block_height,
                min: 1,
                max: height,
            });
        }
        Ok(self
            .dispatch_sessions
            .get_or_derive(&self.chain, &header, height)
            .await?)
    }

    /// Run every per-block duty: claims, proofs, QoS reports, cache
    /// persistence and eviction.
    pub async fn on_new_block(&self, height: u64) {
        self.observe_height(height);
        let started = Instant::now();
        for node in self.nodes.values() {
            let claims = self
                .claims
                .tick(node, height, self.settings.claim_scan_budget)
                .await;
            let reports = self
                .reports
                .tick(node, height, self.settings.claim_scan_budget)
                .await;
            if claims.touched() || reports.touched() {
                debug!(
                    node = %node.address(),
                    height,
                    ?claims,
                    ?reports,
                    "block duties"
                );
            }
            // failures are logged by the node; dirty records stay queued
            let _ = node.flush();
            let evicted = node
                .sessions
                .evict(height, self.settings.session_cache_max_age_blocks);
            if evicted > 0 {
                debug!(node = %node.address(), evicted, "sessions evicted");
            }
        }
        self.dispatch_sessions
            .evict(height, self.settings.session_cache_max_age_blocks);
        debug!(height, elapsed_ms = started.elapsed().as_millis() as u64, "block processed");
    }

    /// Persist every cache and the database.
    pub fn flush_all(&self) -> Result<(), RuntimeError> {
        let mut first_err = None;
        for node in self.nodes.values() {
            if let Err(e) = node.flush() {
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.storage.flush() {
            warn!(error = %e, "database flush failed");
            return Err(e.into());
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Running fisherman samplers
    pub fn active_samplers(&self) -> usize {
        self.samplers.lock().len()
    }

    /// Periodic stats line
    pub fn log_stats(&self) {
        let m = self.metrics.snapshot();
        let evidence: usize = self.nodes.values().map(|n| n.evidence.keys().len()).sum();
        let results: usize = self.nodes.values().map(|n| n.results.keys().len()).sum();
        info!(
            height = self.height(),
            relays = m.relays,
            relay_errors = m.relay_errors,
            proofs = m.proofs_stored,
            sealed = m.evidence_sealed,
            claims = m.claims,
            qos_reports = m.qos_reports,
            samples = m.samples,
            penalties = m.penalties,
            evidence,
            results,
            samplers = self.active_samplers(),
            "stats"
        );
    }
}
