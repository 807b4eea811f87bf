//! vipernet core library
//!
//! Core types, canonical encoding, Merkle commitments and cryptographic
//! primitives shared by every vipernet node.
//!
//! # Modules
//!
//! - [`types`]: Protocol types (sessions, relay proofs, evidence, claims)
//! - [`canonical`]: Canonical JSON for hashing/signing, postcard for storage
//! - [`crypto`]: SHA3-256 hashing, ed25519 signatures, address codecs
//! - [`merkle`]: Sorted-leaf Merkle tree with hash ranges
//! - [`bloom`]: Bloom filter used for proof deduplication
//! - [`decimal`]: 18-digit fixed-point decimal for QoS scores
//! - [`msgs`]: On-chain claim, proof and QoS report messages
//! - [`error`]: Error types

pub mod bloom;
pub mod canonical;
pub mod crypto;
pub mod decimal;
pub mod error;
pub mod merkle;
pub mod msgs;
pub mod types;

#[cfg(test)]
mod test_vectors;

pub use decimal::Dec;
pub use error::{Error, Result};
pub use merkle::{MerkleError, MerkleLeaf, MerkleTree};
pub use types::*;
