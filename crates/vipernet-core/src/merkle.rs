//! Sorted-leaf Merkle tree with hash ranges
//!
//! Leaves are hashed, sorted ascending by hash (stable), renumbered and
//! padded with all-zero leaves up to a power of two. Every node carries the
//! half-open leaf range it covers:
//!
//! ```text
//! parent.hash  = SHA3(left.hash || right.hash || u64_le(left.lower) || u64_le(right.upper))
//! parent.range = [left.lower, right.upper)
//! ```
//!
//! Leaf indexes in proofs refer to positions after sorting.

use crate::canonical::canonical_json;
use crate::crypto;
use crate::error::Result;
use crate::types::{Hash32, HashRange, MerkleProof, Proof, Range, TestResult};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MerkleError {
    #[error("cannot build a merkle tree without leaves")]
    EmptyTree,

    #[error("leaf index {index} out of range for {total} leaves")]
    IndexOutOfRange { index: u64, total: u64 },

    #[error("expected {expected} proof levels, got {got}")]
    InvalidLevelCount { expected: usize, got: usize },

    #[error("revealed leaf does not match the proof target")]
    LeafMismatch,

    #[error("merkle proof does not verify against the root")]
    InvalidMerkleVerify,

    #[error("replay attack detected: {0}")]
    ReplayAttack(String),
}

/// Something that can be committed to as a Merkle leaf.
pub trait MerkleLeaf {
    /// Deterministic byte representation that is hashed into the leaf.
    fn leaf_bytes(&self) -> Result<Vec<u8>>;

    fn leaf_hash(&self) -> Result<Hash32> {
        Ok(crypto::hash(&self.leaf_bytes()?))
    }
}

impl MerkleLeaf for Proof {
    fn leaf_bytes(&self) -> Result<Vec<u8>> {
        canonical_json(self)
    }
}

impl MerkleLeaf for TestResult {
    fn leaf_bytes(&self) -> Result<Vec<u8>> {
        canonical_json(self)
    }
}

/// Smallest power of two `>= n` (1 for 0 or 1).
pub fn next_pow2(n: u64) -> u64 {
    n.max(1).next_power_of_two()
}

/// Number of sibling levels in a proof: `ceil(log2(n))`.
pub fn level_count(n: u64) -> usize {
    next_pow2(n).trailing_zeros() as usize
}

/// Combine two adjacent nodes.
pub fn parent(left: &HashRange, right: &HashRange) -> HashRange {
    let hash = crypto::hash_parts(&[
        &left.hash.0,
        &right.hash.0,
        &left.range.lower.to_le_bytes(),
        &right.range.upper.to_le_bytes(),
    ]);
    HashRange {
        hash,
        range: Range {
            lower: left.range.lower,
            upper: right.range.upper,
        },
    }
}

/// A fully materialized tree. Level 0 holds the sorted, padded leaves.
#[derive(Clone, Debug)]
pub struct MerkleTree {
    levels: Vec<Vec<HashRange>>,
    num_leaves: u64,
    /// `order[sorted_position] = original_position`
    order: Vec<usize>,
}

impl MerkleTree {
    /// Build a tree from leaves in insertion order.
    pub fn from_leaves<L: MerkleLeaf>(leaves: &[L]) -> Result<Self> {
        let hashes = leaves
            .iter()
            .map(MerkleLeaf::leaf_hash)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_leaf_hashes(hashes)?)
    }

    /// Build a tree from pre-hashed leaves in insertion order.
    pub fn from_leaf_hashes(hashes: Vec<Hash32>) -> std::result::Result<Self, MerkleError> {
        if hashes.is_empty() {
            return Err(MerkleError::EmptyTree);
        }
        let num_leaves = hashes.len() as u64;

        let mut indexed: Vec<(usize, Hash32)> = hashes.into_iter().enumerate().collect();
        // sort_by is stable; equal hashes keep insertion order
        indexed.sort_by(|a, b| a.1.cmp(&b.1));

        let order: Vec<usize> = indexed.iter().map(|(i, _)| *i).collect();
        let width = next_pow2(num_leaves);
        let mut leaves: Vec<HashRange> = Vec::with_capacity(width as usize);
        for (k, (_, hash)) in indexed.into_iter().enumerate() {
            leaves.push(HashRange {
                hash,
                range: Range {
                    lower: k as u64,
                    upper: k as u64 + 1,
                },
            });
        }
        for k in num_leaves..width {
            leaves.push(HashRange {
                hash: Hash32::ZERO,
                range: Range {
                    lower: k,
                    upper: k + 1,
                },
            });
        }

        let mut levels = vec![leaves];
        while levels.last().map(|l| l.len()).unwrap_or(0) > 1 {
            let below = &levels[levels.len() - 1];
            let next: Vec<HashRange> = below
                .chunks(2)
                .map(|pair| parent(&pair[0], &pair[1]))
                .collect();
            levels.push(next);
        }

        Ok(Self {
            levels,
            num_leaves,
            order,
        })
    }

    pub fn root(&self) -> HashRange {
        self.levels
            .last()
            .and_then(|l| l.first())
            .copied()
            .unwrap_or_default()
    }

    pub fn num_leaves(&self) -> u64 {
        self.num_leaves
    }

    /// Original insertion position of the leaf at `sorted_index`.
    pub fn original_index(&self, sorted_index: u64) -> Option<usize> {
        self.order.get(sorted_index as usize).copied()
    }

    /// Sibling path for the leaf at `sorted_index`.
    pub fn proof(&self, sorted_index: u64) -> std::result::Result<MerkleProof, MerkleError> {
        if sorted_index >= self.num_leaves {
            return Err(MerkleError::IndexOutOfRange {
                index: sorted_index,
                total: self.num_leaves,
            });
        }
        let mut hash_ranges = Vec::with_capacity(self.levels.len().saturating_sub(1));
        let mut idx = sorted_index as usize;
        for level in &self.levels[..self.levels.len() - 1] {
            hash_ranges.push(level[idx ^ 1]);
            idx /= 2;
        }
        Ok(MerkleProof {
            target_index: sorted_index,
            hash_ranges,
            target: self.levels[0][sorted_index as usize],
        })
    }
}

/// Verify that `leaf_hash` sits at `proof.target_index` under `root`.
///
/// Besides recomputing the root, the walk enforces that sibling ranges are
/// contiguous and equally wide, that real leaves are strictly ascending at
/// the bottom level and that zero padding only appears past `total_leaves`.
/// Violations of those structural rules are reported as
/// [`MerkleError::ReplayAttack`].
pub fn verify_proof(
    root: &HashRange,
    proof: &MerkleProof,
    leaf_hash: &Hash32,
    total_leaves: u64,
) -> std::result::Result<(), MerkleError> {
    let width = next_pow2(total_leaves);
    if total_leaves == 0 || root.range.lower != 0 || root.range.upper != width {
        return Err(MerkleError::InvalidMerkleVerify);
    }

    let expected_levels = level_count(total_leaves);
    if proof.hash_ranges.len() != expected_levels {
        return Err(MerkleError::InvalidLevelCount {
            expected: expected_levels,
            got: proof.hash_ranges.len(),
        });
    }

    let index = proof.target_index;
    if index >= total_leaves {
        return Err(MerkleError::IndexOutOfRange {
            index,
            total: total_leaves,
        });
    }
    if proof.target.hash != *leaf_hash || leaf_hash.is_zero() {
        return Err(MerkleError::LeafMismatch);
    }
    if proof.target.range.lower != index || proof.target.range.upper != index + 1 {
        return Err(MerkleError::ReplayAttack(format!(
            "target range [{}, {}) does not match index {index}",
            proof.target.range.lower, proof.target.range.upper
        )));
    }

    let mut current = proof.target;
    let mut position = index;
    let mut covered = current.range.width();
    for (level, sibling) in proof.hash_ranges.iter().enumerate() {
        if sibling.range.width() != current.range.width() {
            return Err(MerkleError::ReplayAttack(format!(
                "sibling width {} differs from node width {} at level {level}",
                sibling.range.width(),
                current.range.width()
            )));
        }
        let current_is_left = position % 2 == 0;
        let contiguous = if current_is_left {
            sibling.range.lower == current.range.upper
        } else {
            sibling.range.upper == current.range.lower
        };
        if !contiguous {
            return Err(MerkleError::ReplayAttack(format!(
                "non-contiguous sibling range at level {level}"
            )));
        }

        if level == 0 {
            check_leaf_pair(&current, sibling, current_is_left, total_leaves)?;
        }

        current = if current_is_left {
            parent(&current, sibling)
        } else {
            parent(sibling, &current)
        };
        covered += sibling.range.width();
        position /= 2;
    }

    if covered != width {
        return Err(MerkleError::ReplayAttack(format!(
            "proof covers {covered} leaves, root covers {width}"
        )));
    }
    if current != *root {
        return Err(MerkleError::InvalidMerkleVerify);
    }
    Ok(())
}

fn check_leaf_pair(
    target: &HashRange,
    sibling: &HashRange,
    target_is_left: bool,
    total_leaves: u64,
) -> std::result::Result<(), MerkleError> {
    let sibling_is_padding = sibling.range.lower >= total_leaves;
    if sibling_is_padding != sibling.hash.is_zero() {
        return Err(MerkleError::ReplayAttack(
            "padding leaf out of place".to_string(),
        ));
    }
    if sibling_is_padding {
        return Ok(());
    }
    let (left, right) = if target_is_left {
        (target, sibling)
    } else {
        (sibling, target)
    };
    if left.hash >= right.hash {
        return Err(MerkleError::ReplayAttack(
            "leaves are not strictly ascending".to_string(),
        ));
    }
    Ok(())
}
