//! Deterministic session derivation
//!
//! A session is a pure function of the session header, the block hash at
//! the session start height and the validator set at that height. The only
//! extra input is the jail/pause status at the current height, which can
//! drop an already eligible servicer from the selection.
//!
//! Selection draws without replacement: `u64_be(key[0..8]) mod
//! total_weight` walked over the address-sorted weight list, then
//! `key = SHA3(key)`. Weights are integers; no floating point is involved.

use crate::error::ErrorCode;
use crate::interfaces::{ChainError, ChainHandles};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use vipernet_core::crypto::{self, bytes_to_u64, derive_session_key};
use vipernet_core::*;

/// Divisor applied to the summed raw scores before the weighted draw.
///
/// Scores are 18-decimal fixed point, so each unit score is `10^18` raw.
/// Dividing the sum by `10^15` leaves 1000 weight units per score (3000 for
/// a perfect card), small enough for `u64` weights while keeping three
/// decimals of resolution between servicers.
const WEIGHT_SCALE_DIVISOR: u128 = 1_000_000_000_000_000;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("insufficient servicers: need {needed}, {available} eligible")]
    InsufficientServicers { needed: u32, available: usize },
    #[error("session block height {got} is not a session boundary (expected {expected})")]
    NotABoundary { got: u64, expected: u64 },
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Core(#[from] vipernet_core::Error),
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::InsufficientServicers { .. } => ErrorCode::InsufficientServicers,
            SessionError::NotABoundary { .. } => ErrorCode::InvalidSession,
            SessionError::Chain(e) => e.code(),
            SessionError::Core(_) => ErrorCode::Internal,
        }
    }
}

/// Selection weight derived from a report card.
///
/// `None` for validators that have never been reported on.
pub fn report_card_weight(card: &ReportCard) -> Option<u64> {
    let avg = card.average()?;
    let sum = avg.latency.raw() + avg.availability.raw() + avg.reliability.raw();
    Some(((sum / WEIGHT_SCALE_DIVISOR) as u64).max(1))
}

/// Pick one index from a weight list.
///
/// `index = u64_be(key[0..8]) mod total_weight`, then walk the list until
/// the cumulative weight exceeds `index`.
pub fn weighted_index(weights: &[u64], key: &Hash32) -> Option<usize> {
    let total: u128 = weights.iter().map(|w| *w as u128).sum();
    if total == 0 {
        return None;
    }
    let target = bytes_to_u64(key) as u128 % total;
    let mut cumulative = 0u128;
    for (i, w) in weights.iter().enumerate() {
        cumulative += *w as u128;
        if cumulative > target {
            return Some(i);
        }
    }
    None
}

/// Draw up to `count` distinct candidates.
///
/// `skip` rejects a drawn candidate without replacing it (it is still
/// removed from the pool). Returns the chosen entries and the final key.
fn draw<T: Clone>(
    mut pool: Vec<(T, u64)>,
    count: usize,
    mut key: Hash32,
    mut skip: impl FnMut(&T) -> bool,
) -> (Vec<T>, Hash32) {
    let mut chosen = Vec::with_capacity(count);
    while chosen.len() < count && !pool.is_empty() {
        let weights: Vec<u64> = pool.iter().map(|(_, w)| *w).collect();
        let Some(index) = weighted_index(&weights, &key) else {
            break;
        };
        key = crypto::hash(&key.0);
        let (candidate, _) = pool.remove(index);
        if !skip(&candidate) {
            chosen.push(candidate);
        }
    }
    (chosen, key)
}

/// Snapshot inputs of one session derivation
#[derive(Debug, Clone)]
pub struct SessionInputs {
    pub header: SessionHeader,
    /// Hash of the block at `session_block_height`
    pub block_hash: Hash32,
    /// Validator set at `session_block_height`
    pub validators: Vec<Validator>,
    /// Validators jailed or paused at the current height
    pub inactive_now: HashSet<Address>,
    pub fisherman_count: u32,
}

/// Derive a session from snapshot inputs.
pub fn select_session(inputs: &SessionInputs) -> Result<Session, SessionError> {
    let header = &inputs.header;
    let session_key = derive_session_key(header, &inputs.block_hash)?;

    let mut eligible: Vec<&Validator> = inputs
        .validators
        .iter()
        .filter(|v| v.is_active() && v.serves_chain(&header.chain) && v.serves_geo_zone(&header.geo_zone))
        .collect();
    eligible.sort_by(|a, b| a.address.cmp(&b.address));
    eligible.dedup_by(|a, b| a.address == b.address);

    if eligible.len() < header.num_servicers as usize {
        return Err(SessionError::InsufficientServicers {
            needed: header.num_servicers,
            available: eligible.len(),
        });
    }

    let carded: Vec<Option<u64>> = eligible
        .iter()
        .map(|v| report_card_weight(&v.report_card))
        .collect();
    let default_weight = carded.iter().flatten().copied().min().unwrap_or(1);
    let pool: Vec<(Address, u64)> = eligible
        .iter()
        .zip(carded)
        .map(|(v, w)| (v.address, w.unwrap_or(default_weight)))
        .collect();

    let (servicers, _) = draw(pool, header.num_servicers as usize, session_key, |addr| {
        inputs.inactive_now.contains(addr)
    });
    if servicers.len() < header.num_servicers as usize {
        debug!(
            chosen = servicers.len(),
            needed = header.num_servicers,
            "servicer set undercounted by current-height jail/pause"
        );
    }

    let chosen: HashSet<Address> = servicers.iter().copied().collect();
    let mut fisher_pool: Vec<(Address, u64)> = inputs
        .validators
        .iter()
        .filter(|v| v.is_active() && v.serves_chain(&header.chain) && !chosen.contains(&v.address))
        .map(|v| (v.address, 1))
        .collect();
    fisher_pool.sort_by(|a, b| a.0.cmp(&b.0));
    fisher_pool.dedup_by(|a, b| a.0 == b.0);
    let fisher_key = crypto::hash_parts(&[&session_key.0, b"fishermen"]);
    let (fishermen, _) = draw(fisher_pool, inputs.fisherman_count as usize, fisher_key, |addr| {
        inputs.inactive_now.contains(addr)
    });

    Ok(Session {
        header: header.clone(),
        session_key,
        servicers,
        fishermen,
    })
}

/// Gather snapshot inputs from the chain and derive the session.
pub async fn derive_session(
    chain: &ChainHandles,
    header: &SessionHeader,
    current_height: u64,
) -> Result<Session, SessionError> {
    header.validate_basic()?;
    let shb = header.session_block_height;
    let params = chain.staking.params(shb).await?;
    let expected = params.session_start(shb);
    if expected != shb {
        return Err(SessionError::NotABoundary { got: shb, expected });
    }
    let block_hash = chain.blocks.block_hash(shb).await?;

    let by_chain = chain.staking.validators_by_chain(shb, &header.chain).await?;
    let mut validators = Vec::with_capacity(by_chain.len());
    for address in &by_chain {
        validators.push(chain.staking.get_validator(shb, address).await?);
    }

    let mut inactive_now = HashSet::new();
    if current_height > shb {
        for v in validators.iter().filter(|v| v.is_active()) {
            match chain.staking.get_validator(current_height, &v.address).await {
                Ok(now) if now.jailed || now.paused || !now.staked => {
                    inactive_now.insert(v.address);
                }
                Ok(_) => {}
                Err(ChainError::ValidatorNotFound(_)) => {
                    inactive_now.insert(v.address);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    select_session(&SessionInputs {
        header: header.clone(),
        block_hash,
        validators,
        inactive_now,
        fisherman_count: params.fisherman_count,
    })
}

struct CachedSession {
    session: Arc<Session>,
    session_end: u64,
}

/// Read-through cache of derived sessions keyed by header hash
#[derive(Default)]
pub struct SessionCache {
    sessions: RwLock<HashMap<Hash32, CachedSession>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached session or a fresh derivation.
    pub async fn get_or_derive(
        &self,
        chain: &ChainHandles,
        header: &SessionHeader,
        current_height: u64,
    ) -> Result<Arc<Session>, SessionError> {
        let key = header.hash()?;
        if let Some(cached) = self.sessions.read().get(&key) {
            return Ok(cached.session.clone());
        }
        let session = Arc::new(derive_session(chain, header, current_height).await?);
        let bps = chain.staking.params(header.session_block_height).await?.blocks_per_session;
        let session_end = header.session_block_height + bps.saturating_sub(1);
        self.sessions
            .write()
            .entry(key)
            .or_insert_with(|| CachedSession {
                session: session.clone(),
                session_end,
            });
        Ok(session)
    }

    pub fn get(&self, header: &SessionHeader) -> Option<Arc<Session>> {
        let key = header.hash().ok()?;
        self.sessions.read().get(&key).map(|c| c.session.clone())
    }

    /// Drop sessions that ended more than `max_age_blocks` ago.
    pub fn evict(&self, current_height: u64, max_age_blocks: u64) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, c| c.session_end.saturating_add(max_age_blocks) >= current_height);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
