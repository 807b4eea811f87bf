//! Cryptographic primitives for vipernet
//!
//! All hashing goes through [`hash`]; the algorithm is fixed at SHA3-256.
//! Addresses are the first 20 bytes of SHA-256 over the public key.

use crate::canonical::canonical_json;
use crate::error::{Error, Result};
use crate::types::*;
use bech32::{FromBase32, ToBase32, Variant};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use serde::Serialize;
use sha2::Sha256;
use sha3::{Digest, Sha3_256};

/// The only hash function used for commitments and signatures.
pub const HASH_ALGORITHM: &str = "SHA3-256";

/// Human-readable prefix of bech32 addresses
pub const ADDRESS_HRP: &str = "vipr";

// =============================================================================
// HASHING
// =============================================================================

/// `SHA3-256(bytes)`
pub fn hash(bytes: &[u8]) -> Hash32 {
    Hash32(Sha3_256::digest(bytes).into())
}

/// `SHA3-256(part_0 || part_1 || ...)`
pub fn hash_parts(parts: &[&[u8]]) -> Hash32 {
    let mut hasher = Sha3_256::new();
    for part in parts {
        hasher.update(part);
    }
    Hash32(hasher.finalize().into())
}

// =============================================================================
// SIGNATURES
// =============================================================================

/// Sign with a raw 32-byte ed25519 seed.
pub fn sign(secret: &[u8; 32], msg: &[u8]) -> Signature {
    let key = SigningKey::from_bytes(secret);
    Signature(key.sign(msg).to_bytes())
}

/// Public key of a raw 32-byte ed25519 seed.
pub fn public_key_from_secret(secret: &[u8; 32]) -> PublicKey {
    PublicKey(SigningKey::from_bytes(secret).verifying_key().to_bytes())
}

/// Verify an ed25519 signature.
pub fn verify_signature(pubkey: &PublicKey, msg: &[u8], sig: &Signature) -> Result<()> {
    let vk = VerifyingKey::from_bytes(&pubkey.0)
        .map_err(|e| Error::InvalidPublicKey(e.to_string()))?;
    let sig = ed25519_dalek::Signature::from_bytes(&sig.0);
    vk.verify(msg, &sig).map_err(|_| Error::InvalidSignature)
}

/// Boolean form of [`verify_signature`].
pub fn verify(pubkey: &PublicKey, msg: &[u8], sig: &Signature) -> bool {
    verify_signature(pubkey, msg, sig).is_ok()
}

// =============================================================================
// ADDRESSES
// =============================================================================

/// `SHA-256(pubkey)[0..20]`
pub fn address_from_public_key(pubkey: &PublicKey) -> Address {
    let digest = Sha256::digest(pubkey.0);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest[..20]);
    Address(out)
}

/// Encode an address for display at the user boundary.
pub fn address_to_bech32(address: &Address) -> Result<String> {
    bech32::encode(ADDRESS_HRP, address.0.to_base32(), Variant::Bech32)
        .map_err(|e| Error::InvalidBech32(e.to_string()))
}

/// Decode a user-supplied bech32 address.
pub fn address_from_bech32(s: &str) -> Result<Address> {
    let (hrp, data, variant) = bech32::decode(s).map_err(|e| Error::InvalidBech32(e.to_string()))?;
    if hrp != ADDRESS_HRP {
        return Err(Error::InvalidBech32(format!("unexpected prefix {hrp}")));
    }
    if variant != Variant::Bech32 {
        return Err(Error::InvalidBech32("unexpected checksum variant".into()));
    }
    let bytes = Vec::<u8>::from_base32(&data).map_err(|e| Error::InvalidBech32(e.to_string()))?;
    Address::from_slice(&bytes)
}

/// Accept either hex or bech32.
pub fn parse_address(s: &str) -> Result<Address> {
    if s.starts_with(ADDRESS_HRP) {
        address_from_bech32(s)
    } else {
        Address::from_hex(s)
    }
}

// =============================================================================
// DERIVATIONS
// =============================================================================

#[derive(Serialize)]
struct SessionKeySeed<'a> {
    requestor_pubkey: &'a PublicKey,
    chain: &'a ChainId,
    block_hash: &'a Hash32,
}

/// `SHA3-256(JSON{requestor_pubkey, chain, block_hash})`
///
/// `block_hash` is the hash of the block at the session start height.
pub fn derive_session_key(header: &SessionHeader, block_hash: &Hash32) -> Result<Hash32> {
    let seed = canonical_json(&SessionKeySeed {
        requestor_pubkey: &header.requestor_pubkey,
        chain: &header.chain,
        block_hash,
    })?;
    Ok(hash(&seed))
}

/// `SHA3-256(canonical_json(header) || evidence_type || address)`
pub fn evidence_key(
    header: &SessionHeader,
    evidence_type: EvidenceType,
    address: &Address,
) -> Result<Hash32> {
    let header_bytes = header.bytes()?;
    Ok(hash_parts(&[
        &header_bytes,
        &[evidence_type.as_byte()],
        &address.0,
    ]))
}

#[derive(Serialize)]
struct RevealSeed {
    blockhash: String,
    session_header_hash: String,
}

/// Leaf index a commitment must reveal.
///
/// `u64_be(SHA3(JSON{blockhash, session_header_hash})[0..8]) mod total`
/// where `blockhash` is the hash of the block at the reveal height.
pub fn required_index(
    block_hash: &Hash32,
    header: &SessionHeader,
    total: u64,
) -> Result<u64> {
    if total == 0 {
        return Err(Error::invalid("required index", "total must be positive"));
    }
    let seed = canonical_json(&RevealSeed {
        blockhash: block_hash.to_hex(),
        session_header_hash: header.hash()?.to_hex(),
    })?;
    Ok(bytes_to_u64(&hash(&seed)) % total)
}

/// Big-endian integer from the first eight bytes of a digest.
pub fn bytes_to_u64(digest: &Hash32) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest.0[..8]);
    u64::from_be_bytes(buf)
}
