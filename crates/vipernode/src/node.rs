//! One local identity: signing key plus its own caches

use crate::cache::{CacheError, EvidenceCache, ResultCache};
use crate::session::SessionCache;
use crate::storage::{RecordKind, Storage};
use tracing::{info, warn};
use vipernet_core::{Address, PublicKey};
use vipernet_net::KeyPair;

/// A servicer/fisherman identity hosted by this process
pub struct ViperNode {
    keypair: KeyPair,
    address: Address,
    pub evidence: EvidenceCache,
    pub results: ResultCache,
    pub sessions: SessionCache,
}

impl ViperNode {
    /// Open the identity's trees, replaying persisted records.
    pub fn open(storage: &Storage, keypair: KeyPair) -> Result<Self, CacheError> {
        let address = keypair.address();
        let evidence = EvidenceCache::open(storage.tree(RecordKind::Evidence, &address)?)?;
        let results = ResultCache::open(storage.tree(RecordKind::Results, &address)?)?;
        info!(
            address = %address,
            evidence = evidence.keys().len(),
            results = results.keys().len(),
            "node identity loaded"
        );
        Ok(Self {
            keypair,
            address,
            evidence,
            results,
            sessions: SessionCache::new(),
        })
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    /// Persist both caches. Every cache is attempted; the first error wins.
    pub fn flush(&self) -> Result<(), CacheError> {
        let evidence = self.evidence.flush();
        let results = self.results.flush();
        if let Err(e) = &evidence {
            warn!(address = %self.address, error = %e, "evidence flush failed");
        }
        if let Err(e) = &results {
            warn!(address = %self.address, error = %e, "result flush failed");
        }
        evidence?;
        results?;
        Ok(())
    }
}
