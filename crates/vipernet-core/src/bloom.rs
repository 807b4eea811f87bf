//! Fixed-size bloom filter for proof deduplication
//!
//! Membership is probabilistic: a negative is definitive, a positive must
//! be confirmed against the stored proofs.

use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

/// Number of bits in each filter
pub const BLOOM_BITS: usize = 10_000;

/// Number of probe positions per item
pub const BLOOM_HASHES: u32 = 4;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::new(BLOOM_BITS, BLOOM_HASHES)
    }
}

impl BloomFilter {
    pub fn new(num_bits: usize, num_hashes: u32) -> Self {
        let num_bits = num_bits.max(8);
        Self {
            bits: vec![0u8; num_bits.div_ceil(8)],
            num_bits: num_bits as u64,
            num_hashes: num_hashes.max(1),
        }
    }

    /// Double hashing over one SHA3 digest: `h1 + i * h2`.
    fn positions(&self, item: &[u8]) -> impl Iterator<Item = u64> + '_ {
        let digest = Sha3_256::digest(item);
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(&digest[0..8]);
        b.copy_from_slice(&digest[8..16]);
        let h1 = u64::from_le_bytes(a);
        let h2 = u64::from_le_bytes(b) | 1;
        (0..self.num_hashes as u64)
            .map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits)
    }

    pub fn insert(&mut self, item: &[u8]) {
        let positions: Vec<u64> = self.positions(item).collect();
        for pos in positions {
            self.bits[(pos / 8) as usize] |= 1 << (pos % 8);
        }
    }

    pub fn contains(&self, item: &[u8]) -> bool {
        self.positions(item)
            .all(|pos| self.bits[(pos / 8) as usize] & (1 << (pos % 8)) != 0)
    }

    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|b| *b = 0);
    }
}
