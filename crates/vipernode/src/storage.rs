//! Persistent storage using sled
//!
//! One tree per (record kind, local identity): `evidence/<address>` and
//! `results/<address>`. Values use the storage encoding of
//! `vipernet_core::canonical`.

use sled::Db;
use std::path::Path;
use thiserror::Error;
use vipernet_core::Address;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] vipernet_core::Error),
}

/// Record kinds kept per identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Evidence,
    Results,
}

impl RecordKind {
    fn prefix(self) -> &'static str {
        match self {
            RecordKind::Evidence => "evidence",
            RecordKind::Results => "results",
        }
    }
}

/// Storage backend for vipernode
#[derive(Clone)]
pub struct Storage {
    db: Db,
}

impl Storage {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// In-memory database removed on drop
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Tree holding one kind of record for one identity.
    pub fn tree(&self, kind: RecordKind, address: &Address) -> Result<sled::Tree, StorageError> {
        let name = format!("{}/{}", kind.prefix(), address.to_hex());
        Ok(self.db.open_tree(name)?)
    }

    /// Flush all trees to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn size_on_disk(&self) -> Result<u64, StorageError> {
        Ok(self.db.size_on_disk()?)
    }
}
