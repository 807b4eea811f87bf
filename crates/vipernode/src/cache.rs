//! Evidence and result caches
//!
//! In-memory map of evidence-key → record, backed by a sled tree. Each
//! record sits behind its own lock: readers take it shared for
//! `is_sealed`/`total`, writers exclusively for appends and sealing.
//! Mutations mark the key dirty; [`ProofCache::flush`] persists dirty
//! records and runs on every block, before each claim and at shutdown.
//! Startup replays the tree, skipping undecodable records.

use crate::error::ErrorCode;
use crate::storage::StorageError;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use vipernet_core::canonical::{from_storage_bytes, storage_bytes};
use vipernet_core::crypto::evidence_key;
use vipernet_core::*;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Record(#[from] vipernet_core::Error),
    #[error("over service: {total} of {max} relays already served")]
    OverService { total: u64, max: u64 },
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

impl From<sled::Error> for CacheError {
    fn from(e: sled::Error) -> Self {
        CacheError::Storage(StorageError::Sled(e))
    }
}

impl CacheError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CacheError::Record(vipernet_core::Error::SealedEvidence) => ErrorCode::SealedEvidence,
            CacheError::Record(vipernet_core::Error::DuplicateProof) => ErrorCode::DuplicateProof,
            CacheError::Record(_) => ErrorCode::Internal,
            CacheError::OverService { .. } => ErrorCode::OverService,
            CacheError::Storage(_) => ErrorCode::StorageFailure,
        }
    }
}

/// A record the cache can hold
pub trait CacheRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn key(&self) -> vipernet_core::Result<Hash32>;
    fn header(&self) -> &SessionHeader;
    fn is_sealed(&self) -> bool;
    fn seal(&mut self);
    fn total(&self) -> u64;
}

impl CacheRecord for Evidence {
    fn key(&self) -> vipernet_core::Result<Hash32> {
        Evidence::key(self)
    }
    fn header(&self) -> &SessionHeader {
        &self.header
    }
    fn is_sealed(&self) -> bool {
        self.sealed
    }
    fn seal(&mut self) {
        Evidence::seal(self)
    }
    fn total(&self) -> u64 {
        self.num_proofs
    }
}

impl CacheRecord for FishermanResult {
    fn key(&self) -> vipernet_core::Result<Hash32> {
        FishermanResult::key(self)
    }
    fn header(&self) -> &SessionHeader {
        &self.header
    }
    fn is_sealed(&self) -> bool {
        self.sealed
    }
    fn seal(&mut self) {
        FishermanResult::seal(self)
    }
    fn total(&self) -> u64 {
        self.num_test_results
    }
}

type Entry<R> = Arc<RwLock<R>>;

/// Hybrid memory + sled store of one record kind for one identity
pub struct ProofCache<R: CacheRecord> {
    tree: sled::Tree,
    entries: RwLock<HashMap<Hash32, Entry<R>>>,
    dirty: Mutex<HashSet<Hash32>>,
}

impl<R: CacheRecord> ProofCache<R> {
    /// Open over a tree, replaying every stored record.
    pub fn open(tree: sled::Tree) -> Result<Self, CacheError> {
        let mut entries = HashMap::new();
        let mut skipped = 0usize;
        for item in tree.iter() {
            let (key, value) = item?;
            let record: R = match from_storage_bytes(&value) {
                Ok(r) => r,
                Err(e) => {
                    warn!(key = %hex::encode(&key), error = %e, "skipping corrupt cache record");
                    skipped += 1;
                    continue;
                }
            };
            match Hash32::from_slice(&key) {
                Ok(k) => {
                    entries.insert(k, Arc::new(RwLock::new(record)));
                }
                Err(_) => {
                    warn!(key = %hex::encode(&key), "skipping cache record with malformed key");
                    skipped += 1;
                }
            }
        }
        debug!(records = entries.len(), skipped, "cache replayed");
        Ok(Self {
            tree,
            entries: RwLock::new(entries),
            dirty: Mutex::new(HashSet::new()),
        })
    }

    fn entry(&self, key: &Hash32) -> Option<Entry<R>> {
        self.entries.read().get(key).cloned()
    }

    fn entry_or_create(&self, key: Hash32, create: impl FnOnce() -> R) -> Entry<R> {
        if let Some(entry) = self.entry(&key) {
            return entry;
        }
        self.entries
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(create())))
            .clone()
    }

    fn mark_dirty(&self, key: Hash32) {
        self.dirty.lock().insert(key);
    }

    /// Snapshot of the record under `key`
    pub fn get(&self, key: &Hash32) -> Option<R> {
        self.entry(key).map(|e| e.read().clone())
    }

    pub fn contains(&self, key: &Hash32) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn is_sealed(&self, key: &Hash32) -> bool {
        self.entry(key).map(|e| e.read().is_sealed()).unwrap_or(false)
    }

    pub fn total(&self, key: &Hash32) -> u64 {
        self.entry(key).map(|e| e.read().total()).unwrap_or(0)
    }

    /// Mutate the record under `key`, creating it if absent.
    ///
    /// The closure runs under the record's exclusive lock.
    pub fn update<T>(
        &self,
        key: Hash32,
        create: impl FnOnce() -> R,
        f: impl FnOnce(&mut R) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        let entry = self.entry_or_create(key, create);
        let mut record = entry.write();
        let out = f(&mut record)?;
        drop(record);
        self.mark_dirty(key);
        Ok(out)
    }

    /// Read the record under its shared lock.
    pub fn read<T>(&self, key: &Hash32, f: impl FnOnce(&R) -> T) -> Option<T> {
        self.entry(key).map(|e| f(&e.read()))
    }

    /// Mutate an existing record. Returns false when the key is unknown.
    pub fn modify(&self, key: &Hash32, f: impl FnOnce(&mut R)) -> bool {
        match self.entry(key) {
            Some(entry) => {
                f(&mut entry.write());
                self.mark_dirty(*key);
                true
            }
            None => false,
        }
    }

    /// Mark sealed. Returns false when the key is unknown.
    pub fn seal(&self, key: &Hash32) -> bool {
        self.modify(key, |record| record.seal())
    }

    pub fn delete(&self, key: &Hash32) -> Result<(), CacheError> {
        self.entries.write().remove(key);
        self.dirty.lock().remove(key);
        self.tree.remove(key.0)?;
        Ok(())
    }

    /// Keys of all records, sorted for deterministic scans.
    pub fn keys(&self) -> Vec<Hash32> {
        let mut keys: Vec<Hash32> = self.entries.read().keys().copied().collect();
        keys.sort();
        keys
    }

    /// Keys of unsealed records
    pub fn unsealed_keys(&self) -> Vec<Hash32> {
        let entries = self.entries.read();
        let mut keys: Vec<Hash32> = entries
            .iter()
            .filter(|(_, e)| !e.read().is_sealed())
            .map(|(k, _)| *k)
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Persist dirty records and flush the tree.
    pub fn flush(&self) -> Result<usize, CacheError> {
        let dirty: Vec<Hash32> = self.dirty.lock().drain().collect();
        let mut written = 0;
        for (i, key) in dirty.iter().enumerate() {
            let Some(entry) = self.entry(key) else {
                continue;
            };
            let bytes = match storage_bytes(&*entry.read()) {
                Ok(b) => b,
                Err(e) => {
                    self.requeue(&dirty[i..]);
                    return Err(e.into());
                }
            };
            if let Err(e) = self.tree.insert(key.0, bytes) {
                self.requeue(&dirty[i..]);
                return Err(e.into());
            }
            written += 1;
        }
        self.tree.flush()?;
        Ok(written)
    }

    fn requeue(&self, keys: &[Hash32]) {
        self.dirty.lock().extend(keys.iter().copied());
    }
}

/// Relay and challenge evidence of one servicer identity
pub struct EvidenceCache {
    inner: ProofCache<Evidence>,
}

impl EvidenceCache {
    pub fn open(tree: sled::Tree) -> Result<Self, CacheError> {
        Ok(Self {
            inner: ProofCache::open(tree)?,
        })
    }

    pub fn records(&self) -> &ProofCache<Evidence> {
        &self.inner
    }

    /// Check a proof could be appended without mutating anything.
    pub fn check_proof(
        &self,
        header: &SessionHeader,
        servicer: &Address,
        proof: &Proof,
        max_relays: Option<u64>,
    ) -> Result<(), CacheError> {
        let key = evidence_key(header, proof.evidence_type(), servicer)?;
        let checked = self.inner.read(&key, |ev| -> Result<(), CacheError> {
            if ev.sealed {
                return Err(vipernet_core::Error::SealedEvidence.into());
            }
            if !ev.is_unique(proof)? {
                return Err(vipernet_core::Error::DuplicateProof.into());
            }
            if let Some(max) = max_relays {
                if ev.num_proofs >= max {
                    return Err(CacheError::OverService {
                        total: ev.num_proofs,
                        max,
                    });
                }
            }
            Ok(())
        });
        checked.unwrap_or(Ok(()))
    }

    /// Append a proof, enforcing sealing, uniqueness and the relay cap.
    ///
    /// Evidence reaching `max_relays` is sealed in the same critical
    /// section. Returns the new proof count.
    pub fn set_proof(
        &self,
        header: &SessionHeader,
        servicer: &Address,
        proof: Proof,
        max_relays: Option<u64>,
    ) -> Result<u64, CacheError> {
        let evidence_type = proof.evidence_type();
        let key = evidence_key(header, evidence_type, servicer)?;
        self.inner.update(
            key,
            || Evidence::new(header.clone(), *servicer, evidence_type),
            |ev| {
                if let Some(max) = max_relays {
                    if !ev.sealed && ev.num_proofs >= max {
                        return Err(CacheError::OverService {
                            total: ev.num_proofs,
                            max,
                        });
                    }
                }
                let total = ev.push(proof)?;
                if let Some(max) = max_relays {
                    if total >= max {
                        debug!(servicer = %servicer, total, "evidence reached relay cap, sealing");
                        ev.seal();
                    }
                }
                Ok(total)
            },
        )
    }

    pub fn get(&self, key: &Hash32) -> Option<Evidence> {
        self.inner.get(key)
    }

    pub fn is_unique(&self, key: &Hash32, proof: &Proof) -> Result<bool, CacheError> {
        match self.inner.read(key, |ev| ev.is_unique(proof)) {
            Some(r) => Ok(r?),
            None => Ok(true),
        }
    }

    pub fn is_sealed(&self, key: &Hash32) -> bool {
        self.inner.is_sealed(key)
    }

    pub fn total_proofs(&self, key: &Hash32) -> u64 {
        self.inner.total(key)
    }

    pub fn seal(&self, key: &Hash32) -> bool {
        self.inner.seal(key)
    }

    pub fn delete(&self, key: &Hash32) -> Result<(), CacheError> {
        self.inner.delete(key)
    }

    pub fn keys(&self) -> Vec<Hash32> {
        self.inner.keys()
    }

    /// Keys of evidence still accepting proofs
    pub fn unsealed_keys(&self) -> Vec<Hash32> {
        self.inner.unsealed_keys()
    }

    pub fn flush(&self) -> Result<usize, CacheError> {
        self.inner.flush()
    }
}

/// Fisherman test results of one fisherman identity
pub struct ResultCache {
    inner: ProofCache<FishermanResult>,
}

impl ResultCache {
    pub fn open(tree: sled::Tree) -> Result<Self, CacheError> {
        Ok(Self {
            inner: ProofCache::open(tree)?,
        })
    }

    /// Append a test result for (session, servicer).
    pub fn add_result(
        &self,
        header: &SessionHeader,
        result: TestResult,
    ) -> Result<u64, CacheError> {
        let servicer = result.servicer_address;
        let key = evidence_key(header, EvidenceType::FishermanTestEvidence, &servicer)?;
        self.inner.update(
            key,
            || FishermanResult::new(header.clone(), servicer),
            |set| Ok(set.push(result)?),
        )
    }

    pub fn get(&self, key: &Hash32) -> Option<FishermanResult> {
        self.inner.get(key)
    }

    pub fn total_results(&self, key: &Hash32) -> u64 {
        self.inner.total(key)
    }

    pub fn seal(&self, key: &Hash32) -> bool {
        self.inner.seal(key)
    }

    /// Seal a set, recording the session-wide fastest latency.
    pub fn seal_scored(&self, key: &Hash32, session_fastest: Option<Duration>) -> bool {
        self.inner.modify(key, |set| set.seal_scored(session_fastest))
    }

    pub fn delete(&self, key: &Hash32) -> Result<(), CacheError> {
        self.inner.delete(key)
    }

    pub fn keys(&self) -> Vec<Hash32> {
        self.inner.keys()
    }

    pub fn flush(&self) -> Result<usize, CacheError> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{RecordKind, Storage};
    use std::time::Duration;
    use tempfile::tempdir;

    fn header() -> SessionHeader {
        SessionHeader {
            requestor_pubkey: PublicKey([1; 32]),
            chain: ChainId::new("0001").unwrap(),
            geo_zone: GeoZoneId::new("0001").unwrap(),
            num_servicers: 5,
            session_block_height: 1,
        }
    }

    fn proof(entropy: i64) -> Proof {
        Proof::Relay(RelayProof {
            entropy,
            request_hash: Hash32([2; 32]),
            session_block_height: 1,
            servicer_pubkey: PublicKey([3; 32]),
            chain: ChainId::new("0001").unwrap(),
            geo_zone: GeoZoneId::new("0001").unwrap(),
            num_servicers: 5,
            token: Aat {
                version: AAT_VERSION.into(),
                requestor_pubkey: PublicKey([1; 32]),
                client_pubkey: PublicKey([4; 32]),
                requestor_signature: Signature([0; 64]),
            },
            signature: Signature([0; 64]),
        })
    }

    fn evidence_cache() -> (EvidenceCache, Storage) {
        let storage = Storage::temporary().unwrap();
        let tree = storage.tree(RecordKind::Evidence, &Address([9; 20])).unwrap();
        (EvidenceCache::open(tree).unwrap(), storage)
    }

    #[test]
    fn test_duplicate_proof_stored_once() {
        let (cache, _s) = evidence_cache();
        let servicer = Address([9; 20]);
        assert_eq!(cache.set_proof(&header(), &servicer, proof(1), None).unwrap(), 1);
        let err = cache.set_proof(&header(), &servicer, proof(1), None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateProof);
        let key = evidence_key(&header(), EvidenceType::RelayEvidence, &servicer).unwrap();
        assert_eq!(cache.total_proofs(&key), 1);
    }

    #[test]
    fn test_sealed_evidence_is_frozen() {
        let (cache, _s) = evidence_cache();
        let servicer = Address([9; 20]);
        cache.set_proof(&header(), &servicer, proof(1), None).unwrap();
        let key = evidence_key(&header(), EvidenceType::RelayEvidence, &servicer).unwrap();
        assert!(cache.seal(&key));
        let err = cache.set_proof(&header(), &servicer, proof(2), None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SealedEvidence);
        assert_eq!(cache.total_proofs(&key), 1);
        assert!(cache.unsealed_keys().is_empty());
    }

    #[test]
    fn test_relay_cap_seals_and_rejects() {
        let (cache, _s) = evidence_cache();
        let servicer = Address([9; 20]);
        cache.set_proof(&header(), &servicer, proof(1), Some(2)).unwrap();
        cache.set_proof(&header(), &servicer, proof(2), Some(2)).unwrap();
        let key = evidence_key(&header(), EvidenceType::RelayEvidence, &servicer).unwrap();
        assert!(cache.is_sealed(&key));
        assert!(cache.check_proof(&header(), &servicer, &proof(3), Some(2)).is_err());
    }

    #[test]
    fn test_check_proof_over_service() {
        let (cache, _s) = evidence_cache();
        let servicer = Address([9; 20]);
        cache.set_proof(&header(), &servicer, proof(1), None).unwrap();
        let err = cache
            .check_proof(&header(), &servicer, &proof(2), Some(1))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::OverService);
        assert!(cache.check_proof(&header(), &servicer, &proof(2), Some(5)).is_ok());
    }

    #[test]
    fn test_flush_and_replay() {
        let dir = tempdir().unwrap();
        let servicer = Address([9; 20]);
        {
            let storage = Storage::open(dir.path()).unwrap();
            let cache =
                EvidenceCache::open(storage.tree(RecordKind::Evidence, &servicer).unwrap()).unwrap();
            for e in 0..3 {
                cache.set_proof(&header(), &servicer, proof(e), None).unwrap();
            }
            assert_eq!(cache.flush().unwrap(), 1);
            storage.flush().unwrap();
        }
        let storage = Storage::open(dir.path()).unwrap();
        let cache =
            EvidenceCache::open(storage.tree(RecordKind::Evidence, &servicer).unwrap()).unwrap();
        let key = evidence_key(&header(), EvidenceType::RelayEvidence, &servicer).unwrap();
        assert_eq!(cache.total_proofs(&key), 3);
        // bloom survives the round trip
        assert!(cache
            .set_proof(&header(), &servicer, proof(2), None)
            .is_err());
    }

    #[test]
    fn test_corrupt_record_skipped() {
        let storage = Storage::temporary().unwrap();
        let servicer = Address([9; 20]);
        let tree = storage.tree(RecordKind::Evidence, &servicer).unwrap();
        tree.insert([7u8; 32], b"garbage".to_vec()).unwrap();
        let cache = EvidenceCache::open(tree).unwrap();
        assert!(cache.keys().is_empty());
    }

    #[test]
    fn test_delete_removes_persisted_record() {
        let storage = Storage::temporary().unwrap();
        let servicer = Address([9; 20]);
        let tree = storage.tree(RecordKind::Evidence, &servicer).unwrap();
        let cache = EvidenceCache::open(tree.clone()).unwrap();
        cache.set_proof(&header(), &servicer, proof(1), None).unwrap();
        cache.flush().unwrap();
        let key = evidence_key(&header(), EvidenceType::RelayEvidence, &servicer).unwrap();
        cache.delete(&key).unwrap();
        assert!(cache.get(&key).is_none());
        assert!(tree.get(key.0).unwrap().is_none());
    }

    #[test]
    fn test_result_cache_appends() {
        let storage = Storage::temporary().unwrap();
        let cache =
            ResultCache::open(storage.tree(RecordKind::Results, &Address([8; 20])).unwrap()).unwrap();
        let servicer = Address([5; 20]);
        for i in 0..4 {
            let n = cache
                .add_result(
                    &header(),
                    TestResult {
                        servicer_address: servicer,
                        timestamp_ms: i,
                        latency: Duration::from_millis(10),
                        is_available: true,
                        is_reliable: true,
                    },
                )
                .unwrap();
            assert_eq!(n, i + 1);
        }
        let key = evidence_key(&header(), EvidenceType::FishermanTestEvidence, &servicer).unwrap();
        assert_eq!(cache.total_results(&key), 4);
        cache.seal(&key);
        let err = cache
            .add_result(
                &header(),
                TestResult {
                    servicer_address: servicer,
                    timestamp_ms: 9,
                    latency: Duration::from_millis(10),
                    is_available: false,
                    is_reliable: false,
                },
            )
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SealedEvidence);
    }
}
