//! Sample payloads fishermen send to servicers
//!
//! File format: `[{"blockchain": "0001", "payloads": [{data, method, path, headers}]}]`

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use vipernet_core::{ChainId, RelayPayload};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to read sample pool: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid sample pool: {0}")]
    Json(#[from] serde_json::Error),
    #[error("chain {0} listed twice in sample pool")]
    Duplicate(ChainId),
}

#[derive(Debug, Clone, Deserialize)]
struct PoolEntry {
    blockchain: ChainId,
    #[serde(default)]
    payloads: Vec<RelayPayload>,
}

/// Per-chain sample payloads
#[derive(Debug, Clone, Default)]
pub struct SamplePool {
    by_chain: HashMap<ChainId, Vec<RelayPayload>>,
}

impl SamplePool {
    pub fn new(entries: impl IntoIterator<Item = (ChainId, Vec<RelayPayload>)>) -> Result<Self, PoolError> {
        let mut by_chain = HashMap::new();
        for (chain, payloads) in entries {
            // servicers reject empty payloads
            let payloads: Vec<RelayPayload> =
                payloads.into_iter().filter(|p| !p.is_empty()).collect();
            if by_chain.insert(chain.clone(), payloads).is_some() {
                return Err(PoolError::Duplicate(chain));
            }
        }
        Ok(Self { by_chain })
    }

    pub fn from_json(json: &str) -> Result<Self, PoolError> {
        let entries: Vec<PoolEntry> = serde_json::from_str(json)?;
        Self::new(entries.into_iter().map(|e| (e.blockchain, e.payloads)))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PoolError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Payloads configured for a chain
    pub fn payloads(&self, chain: &ChainId) -> &[RelayPayload] {
        self.by_chain.get(chain).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Uniformly random payload for a chain
    pub fn choose<R: Rng + ?Sized>(&self, chain: &ChainId, rng: &mut R) -> Option<&RelayPayload> {
        self.payloads(chain).choose(rng)
    }

    pub fn len(&self) -> usize {
        self.by_chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_chain.is_empty()
    }
}
