//! Node signing keys
//!
//! Every local servicer/fisherman identity is one ed25519 keypair.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::fmt;
use thiserror::Error;
use vipernet_core::{Address, PublicKey, Signature};

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key seed: {0}")]
    InvalidSeed(String),
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("signature verification failed")]
    SignatureVerificationFailed,
}

/// Ed25519 keypair for signing and identity
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create from seed bytes (for deterministic testing)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Create from a 64-character hex seed.
    pub fn from_hex_seed(seed: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(seed.trim()).map_err(|e| CryptoError::InvalidSeed(e.to_string()))?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidSeed(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(Self::from_seed(&seed))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    pub fn address(&self) -> Address {
        self.public_key().address()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes())
    }

    /// Verify a signature
    pub fn verify(
        public_key: &PublicKey,
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), CryptoError> {
        let verifying_key =
            VerifyingKey::from_bytes(&public_key.0).map_err(|_| CryptoError::InvalidPublicKey)?;
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_sign_verify() {
        let kp = KeyPair::generate();
        let msg = b"hello world";
        let sig = kp.sign(msg);

        assert!(KeyPair::verify(&kp.public_key(), msg, &sig).is_ok());
        assert!(KeyPair::verify(&kp.public_key(), b"tampered", &sig).is_err());
    }

    #[test]
    fn test_hex_seed() {
        let kp = KeyPair::from_hex_seed(&"07".repeat(32)).unwrap();
        assert_eq!(kp.public_key(), KeyPair::from_seed(&[7; 32]).public_key());
        assert!(KeyPair::from_hex_seed("0707").is_err());
        assert!(KeyPair::from_hex_seed("zz").is_err());
    }

    #[test]
    fn test_matches_core_signatures() {
        let kp = KeyPair::from_seed(&[3; 32]);
        let sig = kp.sign(b"relay");
        assert_eq!(sig, vipernet_core::crypto::sign(&[3; 32], b"relay"));
    }

    #[test]
    fn test_debug_hides_secret() {
        let kp = KeyPair::from_seed(&[1; 32]);
        let dbg = format!("{kp:?}");
        assert!(dbg.contains("public_key"));
        assert!(!dbg.contains(&hex::encode([1u8; 32])));
    }
}
