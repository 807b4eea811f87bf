//! Hosted-chain configuration
//!
//! A JSON array of `{id, url, websocket_url?, basic_auth?}` naming the
//! upstream endpoints this node forwards relays to.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use vipernet_core::ChainId;

#[derive(Debug, Error)]
pub enum ChainsError {
    #[error("failed to read chains file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse chains file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("chain {0} is configured more than once")]
    Duplicate(ChainId),
    #[error("chain {id} has an invalid url: {url}")]
    InvalidUrl { id: ChainId, url: String },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// One upstream blockchain endpoint
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostedChain {
    pub id: ChainId,
    pub url: String,
    #[serde(default)]
    pub websocket_url: Option<String>,
    #[serde(default)]
    pub basic_auth: Option<BasicAuth>,
}

impl HostedChain {
    pub fn supports_websocket(&self) -> bool {
        self.websocket_url.is_some()
    }
}

/// Chains served by this node, keyed by id
#[derive(Clone, Debug, Default)]
pub struct HostedChains {
    chains: HashMap<ChainId, HostedChain>,
}

impl HostedChains {
    pub fn new(chains: Vec<HostedChain>) -> Result<Self, ChainsError> {
        let mut map = HashMap::with_capacity(chains.len());
        for chain in chains {
            let valid = |u: &str| u.starts_with("http://") || u.starts_with("https://");
            if !valid(&chain.url) {
                return Err(ChainsError::InvalidUrl {
                    id: chain.id.clone(),
                    url: chain.url.clone(),
                });
            }
            if let Some(ws) = &chain.websocket_url {
                if !(ws.starts_with("ws://") || ws.starts_with("wss://")) {
                    return Err(ChainsError::InvalidUrl {
                        id: chain.id.clone(),
                        url: ws.clone(),
                    });
                }
            }
            let id = chain.id.clone();
            if map.insert(id.clone(), chain).is_some() {
                return Err(ChainsError::Duplicate(id));
            }
        }
        Ok(Self { chains: map })
    }

    pub fn from_json(json: &str) -> Result<Self, ChainsError> {
        let chains: Vec<HostedChain> = serde_json::from_str(json)?;
        Self::new(chains)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ChainsError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn get(&self, id: &ChainId) -> Option<&HostedChain> {
        self.chains.get(id)
    }

    pub fn contains(&self, id: &ChainId) -> bool {
        self.chains.contains_key(id)
    }

    /// Hosted chain ids, sorted
    pub fn ids(&self) -> Vec<ChainId> {
        let mut ids: Vec<ChainId> = self.chains.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}
