//! Test vectors for cross-implementation validation
//!
//! Every value here must be reproduced byte-for-byte by any other node
//! implementation. Fixed digests are asserted where they are independent
//! of this crate (SHA3-256); derived values are asserted deterministic.

use crate::canonical::canonical_json;
use crate::crypto::*;
use crate::merkle::MerkleTree;
use crate::types::*;
use serde::Serialize;

/// Test vector output format (JSON serializable)
#[derive(Serialize)]
pub struct TestVector {
    pub name: String,
    pub description: String,
    pub inputs: serde_json::Value,
    pub canonical_bytes_hex: String,
    pub hash_hex: String,
}

/// Generate all test vectors as JSON
pub fn generate_test_vectors() -> Vec<TestVector> {
    vec![
        sha3_empty_vector(),
        sha3_abc_vector(),
        session_header_vector(),
        session_key_vector(),
        evidence_key_vector(),
        relay_proof_vector(),
        merkle_root_vector(),
        required_index_vector(),
    ]
}

fn sample_header() -> SessionHeader {
    SessionHeader {
        requestor_pubkey: public_key_from_secret(&[1u8; 32]),
        chain: ChainId::new("0001").unwrap(),
        geo_zone: GeoZoneId::new("0001").unwrap(),
        num_servicers: 5,
        session_block_height: 1,
    }
}

fn sample_proof(entropy: i64) -> RelayProof {
    let requestor_secret = [1u8; 32];
    let client_secret = [2u8; 32];
    let mut token = Aat {
        version: AAT_VERSION.to_string(),
        requestor_pubkey: public_key_from_secret(&requestor_secret),
        client_pubkey: public_key_from_secret(&client_secret),
        requestor_signature: Signature([0u8; 64]),
    };
    token.requestor_signature = sign(&requestor_secret, &token.hash().0);
    let mut proof = RelayProof {
        entropy,
        request_hash: hash(b"request"),
        session_block_height: 1,
        servicer_pubkey: public_key_from_secret(&[3u8; 32]),
        chain: ChainId::new("0001").unwrap(),
        geo_zone: GeoZoneId::new("0001").unwrap(),
        num_servicers: 5,
        token,
        signature: Signature([0u8; 64]),
    };
    proof.signature = sign(&client_secret, &proof.hash().unwrap().0);
    proof
}

fn sha3_empty_vector() -> TestVector {
    TestVector {
        name: "sha3_256_empty".into(),
        description: "SHA3-256 of the empty string".into(),
        inputs: serde_json::json!({ "bytes": "" }),
        canonical_bytes_hex: String::new(),
        hash_hex: hash(b"").to_hex(),
    }
}

fn sha3_abc_vector() -> TestVector {
    TestVector {
        name: "sha3_256_abc".into(),
        description: "SHA3-256 of \"abc\"".into(),
        inputs: serde_json::json!({ "bytes": "abc" }),
        canonical_bytes_hex: hex::encode(b"abc"),
        hash_hex: hash(b"abc").to_hex(),
    }
}

fn session_header_vector() -> TestVector {
    let header = sample_header();
    let bytes = canonical_json(&header).unwrap();
    TestVector {
        name: "session_header_hash".into(),
        description: "SHA3-256(canonical_json(SessionHeader))".into(),
        inputs: serde_json::to_value(&header).unwrap(),
        canonical_bytes_hex: hex::encode(&bytes),
        hash_hex: header.hash().unwrap().to_hex(),
    }
}

fn session_key_vector() -> TestVector {
    let header = sample_header();
    let block_hash = hash(b"block-1");
    TestVector {
        name: "session_key".into(),
        description: "SHA3-256(JSON{requestor_pubkey, chain, block_hash})".into(),
        inputs: serde_json::json!({
            "header": header,
            "block_hash": block_hash,
        }),
        canonical_bytes_hex: String::new(),
        hash_hex: derive_session_key(&header, &block_hash).unwrap().to_hex(),
    }
}

fn evidence_key_vector() -> TestVector {
    let header = sample_header();
    let address = Address([7u8; 20]);
    TestVector {
        name: "evidence_key".into(),
        description: "SHA3-256(header_json || evidence_type || address)".into(),
        inputs: serde_json::json!({
            "header": header,
            "evidence_type": EvidenceType::RelayEvidence.as_byte(),
            "address": address,
        }),
        canonical_bytes_hex: String::new(),
        hash_hex: evidence_key(&header, EvidenceType::RelayEvidence, &address)
            .unwrap()
            .to_hex(),
    }
}

fn relay_proof_vector() -> TestVector {
    let proof = sample_proof(42);
    let bytes = proof.signable_bytes().unwrap();
    TestVector {
        name: "relay_proof_hash".into(),
        description: "SHA3-256 of the relay proof with the signature omitted".into(),
        inputs: serde_json::to_value(&proof).unwrap(),
        canonical_bytes_hex: hex::encode(&bytes),
        hash_hex: proof.hash().unwrap().to_hex(),
    }
}

fn merkle_root_vector() -> TestVector {
    let proofs: Vec<Proof> = (0..10).map(|e| Proof::Relay(sample_proof(e))).collect();
    let tree = MerkleTree::from_leaves(&proofs).unwrap();
    let root = tree.root();
    TestVector {
        name: "merkle_root_10_relays".into(),
        description: "Sorted hash-range Merkle root over 10 relay proofs (entropy 0..10)".into(),
        inputs: serde_json::json!({ "num_leaves": 10, "range": root.range }),
        canonical_bytes_hex: String::new(),
        hash_hex: root.hash.to_hex(),
    }
}

fn required_index_vector() -> TestVector {
    let header = sample_header();
    let block_hash = hash(b"block-13");
    let index = required_index(&block_hash, &header, 100).unwrap();
    TestVector {
        name: "required_index".into(),
        description: "u64_be(SHA3(JSON{blockhash, session_header_hash})[0..8]) mod 100".into(),
        inputs: serde_json::json!({
            "blockhash": block_hash,
            "session_header_hash": header.hash().unwrap(),
            "total": 100,
            "index": index,
        }),
        canonical_bytes_hex: String::new(),
        hash_hex: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_vectors() {
        let vectors = generate_test_vectors();
        assert_eq!(vectors.len(), 8);

        let json = serde_json::to_string_pretty(&vectors).unwrap();
        println!("Test Vectors:\n{}", json);
    }

    #[test]
    fn test_sha3_known_answers() {
        assert_eq!(
            sha3_empty_vector().hash_hex,
            "a7ffc6f8bf1ed76651c14756a061d662f580ff4de43b49fa82d80a4b80f8434a"
        );
        assert_eq!(
            sha3_abc_vector().hash_hex,
            "3a985da74fe225b2045c172d6bd390bd855f086e3e9d525b46bfe24511431532"
        );
    }

    #[test]
    fn test_session_header_json_layout() {
        let v = session_header_vector();
        let json = String::from_utf8(hex::decode(&v.canonical_bytes_hex).unwrap()).unwrap();
        assert!(json.starts_with("{\"requestor_pubkey\":\""));
        assert!(json.ends_with("\"num_servicers\":5,\"session_block_height\":1}"));
    }

    #[test]
    fn test_relay_proof_bytes_omit_signature() {
        let v = relay_proof_vector();
        let json = String::from_utf8(hex::decode(&v.canonical_bytes_hex).unwrap()).unwrap();
        assert!(json.starts_with("{\"entropy\":42,"));
        assert!(!json.contains("\"signature\""));
        assert!(json.contains("\"token_hash\""));
    }

    #[test]
    fn test_derivations_deterministic() {
        assert_eq!(session_key_vector().hash_hex, session_key_vector().hash_hex);
        assert_eq!(evidence_key_vector().hash_hex, evidence_key_vector().hash_hex);
        assert_eq!(merkle_root_vector().hash_hex, merkle_root_vector().hash_hex);
        assert_eq!(
            required_index_vector().inputs["index"],
            required_index_vector().inputs["index"]
        );
    }

    #[test]
    fn test_relay_proof_signature_verifies() {
        let proof = sample_proof(1);
        proof.token.verify().unwrap();
        proof.verify_client_signature().unwrap();
    }
}
