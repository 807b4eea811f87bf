//! Relay service end to end against the devnet chain

mod common;

use common::*;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use vipernet_core::msgs::{MsgProof, PROOF_FEE};
use vipernet_core::*;
use vipernode::claims::validate_proof_message;
use vipernode::devnet::{ChainEvent, DevnetChain};
use vipernode::interfaces::{BlockSource, ChainTx, Requestors};
use vipernode::server::router;
use vipernode::session::derive_session;
use vipernode::{ChainHandles, ErrorCode, RuntimeSettings, Storage, ViperNode};

#[tokio::test]
async fn test_happy_path_relay() {
    let h = Harness::new().await;
    let servicer = h.servicer(1).await;
    let key = h.evidence_key(1, &servicer.address());
    let node = h.runtime.node(&servicer.address()).unwrap();
    assert_eq!(node.evidence.total_proofs(&key), 0);

    let relay = signed_relay(&servicer.public_key(), 1, 1, 1);
    let response = h.runtime.handle_relay(relay.clone()).await.unwrap();

    assert_eq!(response.response, "bar");
    assert_eq!(response.proof, relay.proof);
    response.verify().unwrap();
    assert_eq!(node.evidence.total_proofs(&key), 1);

    let requestor = h
        .devnet
        .get_requestor(1, &relay.proof.token.requestor_pubkey.address())
        .await
        .unwrap();
    assert_eq!(requestor.max_possible_relays(), 2_000_000);
}

#[tokio::test]
async fn test_duplicate_proof_rejected() {
    let h = Harness::new().await;
    let servicer = h.servicer(1).await;
    let relay = signed_relay(&servicer.public_key(), 7, 1, 1);

    h.runtime.handle_relay(relay.clone()).await.unwrap();
    let err = h.runtime.handle_relay(relay).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::DuplicateProof);

    let node = h.runtime.node(&servicer.address()).unwrap();
    assert_eq!(node.evidence.total_proofs(&h.evidence_key(1, &servicer.address())), 1);
}

#[tokio::test]
async fn test_session_sync_allowance() {
    let strict = RuntimeSettings {
        client_session_sync_allowance: 0,
        ..RuntimeSettings::default()
    };
    let h = Harness::with(strict, None).await;
    h.devnet.advance_to(5);
    let servicer = h.servicer(1).await;
    let err = h
        .runtime
        .handle_relay(signed_relay(&servicer.public_key(), 1, 5, 1))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidBlockHeight);

    let h = Harness::new().await;
    h.devnet.advance_to(5);
    let servicer = h.servicer(1).await;
    let response = h
        .runtime
        .handle_relay(signed_relay(&servicer.public_key(), 1, 5, 1))
        .await
        .unwrap();
    assert_eq!(response.response, "bar");
}

#[tokio::test]
async fn test_session_derivation_is_deterministic() {
    let a = Arc::new(DevnetChain::new(genesis()).unwrap());
    let b = Arc::new(DevnetChain::new(genesis()).unwrap());
    a.advance_to(9);
    b.advance_to(9);
    let header = SessionHeader {
        requestor_pubkey: PublicKey([42; 32]),
        chain: chain_id(),
        geo_zone: geo_zone(),
        num_servicers: 5,
        session_block_height: 5,
    };

    let first = derive_session(&ChainHandles::from_single(a), &header, 9).await.unwrap();
    let second = derive_session(&ChainHandles::from_single(b), &header, 9).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.servicers.len(), 5);
    let mut unique = first.servicers.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 5);
    assert_eq!(first.fishermen.len(), 1);
    assert!(!first.servicers.contains(&first.fishermen[0]));
}

fn reveal(evidence: &Evidence, tree: &MerkleTree, index: u64) -> MsgProof {
    let leaf = evidence.proofs[tree.original_index(index).unwrap()].clone();
    MsgProof {
        claim_merkle_proof: tree.proof(index).unwrap(),
        claim_leaf: leaf,
        claim_evidence_type: EvidenceType::RelayEvidence,
        report_merkle_proof: None,
        report_leaf: None,
        report_evidence_type: None,
    }
}

#[tokio::test]
async fn test_claim_and_proof_cycle() {
    let h = Harness::new().await;
    let servicer = h.servicer(1).await;
    let address = servicer.address();
    for entropy in 0..100 {
        h.runtime
            .handle_relay(signed_relay(&servicer.public_key(), entropy, 1, 1))
            .await
            .unwrap();
    }
    let header = h.header(1);
    let key = h.evidence_key(1, &address);
    let node = h.runtime.node(&address).unwrap();

    // session 1..=4 is still open
    h.runtime.on_new_block(4).await;
    assert!(h.devnet.claim(&address, &header, EvidenceType::RelayEvidence).is_none());

    h.devnet.advance_to(5);
    h.runtime.on_new_block(5).await;
    let claim = h
        .devnet
        .claim(&address, &header, EvidenceType::RelayEvidence)
        .unwrap();
    assert_eq!(claim.total_proofs, 100);
    assert!(node.evidence.is_sealed(&key));

    let evidence = node.evidence.get(&key).unwrap();
    let tree = MerkleTree::from_leaves(&evidence.proofs).unwrap();
    assert_eq!(tree.root(), claim.merkle_root);

    // reveal height is 1 + 3 * 4
    h.devnet.advance_to(13);
    let reveal_hash = h.devnet.block_hash(13).await.unwrap();
    let index = crypto::required_index(&reveal_hash, &header, 100).unwrap();
    let validator = h.devnet.validator(&address).unwrap();

    let msg = reveal(&evidence, &tree, index);
    validate_proof_message(&msg, &claim, &reveal_hash, &validator, None).unwrap();
    let wrong = reveal(&evidence, &tree, (index + 1) % 100);
    let err = validate_proof_message(&wrong, &claim, &reveal_hash, &validator, None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidProofs);

    h.runtime.on_new_block(13).await;
    assert!(h
        .devnet
        .events()
        .contains(&ChainEvent::ProofAccepted { from: address, session: 1, reward: 100_000 }));
    assert!(node.evidence.get(&key).is_none());
    assert!(h.devnet.claim(&address, &header, EvidenceType::RelayEvidence).is_none());
}

#[tokio::test]
async fn test_replayed_leaf_is_burned() {
    let h = Harness::new().await;
    let servicer = h.servicer(1).await;
    let address = servicer.address();
    for entropy in 0..10 {
        h.runtime
            .handle_relay(signed_relay(&servicer.public_key(), entropy, 1, 1))
            .await
            .unwrap();
    }
    let header = h.header(1);
    let node = h.runtime.node(&address).unwrap();
    h.devnet.advance_to(5);
    h.runtime.on_new_block(5).await;
    let claim = h
        .devnet
        .claim(&address, &header, EvidenceType::RelayEvidence)
        .unwrap();

    h.devnet.advance_to(13);
    let evidence = node.evidence.get(&h.evidence_key(1, &address)).unwrap();
    let tree = MerkleTree::from_leaves(&evidence.proofs).unwrap();
    let reveal_hash = h.devnet.block_hash(13).await.unwrap();
    let index = crypto::required_index(&reveal_hash, &header, claim.total_proofs).unwrap();

    // a valid path whose target claims a neighbouring leaf range
    let mut msg = reveal(&evidence, &tree, index);
    msg.claim_merkle_proof.target.range.lower += 1;
    msg.claim_merkle_proof.target.range.upper += 1;

    let before = h.devnet.balance(&address);
    let err = h.devnet.submit_proof(&address, msg).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ReplayAttack);
    assert_eq!(h.devnet.balance(&address), before - PROOF_FEE - 30);
    assert!(h
        .devnet
        .events()
        .contains(&ChainEvent::ReplayBurned { address, amount: 30 }));
    assert!(h.devnet.claim(&address, &header, EvidenceType::RelayEvidence).is_none());
}

async fn serve(h: &Harness) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(h.runtime.clone());
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

#[tokio::test]
async fn test_rpc_relay_and_dispatch() {
    let h = Harness::new().await;
    let addr = serve(&h).await;
    let client = reqwest::Client::new();

    let session: Session = client
        .post(format!("http://{addr}/v1/client/dispatch"))
        .json(&h.header(1))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(session.servicers.len(), 5);

    let servicer = h.servicer(1).await;
    let relay = signed_relay(&servicer.public_key(), 3, 1, 1);
    let response: RelayResponse = client
        .post(format!("http://{addr}/v1/client/relay"))
        .json(&relay)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response.response, "bar");
    response.verify().unwrap();

    let resp = client
        .post(format!("http://{addr}/v1/client/relay"))
        .json(&relay)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], 21);

    let resp = client
        .post(format!("http://{addr}/v1/client/dispatch"))
        .json(&h.header(9))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], 3);
}

#[tokio::test]
async fn test_websocket_relay_stream() {
    let ws_upstream = spawn_ws_upstream().await;
    let h = Harness::with(RuntimeSettings::default(), Some(ws_upstream)).await;
    let addr = serve(&h).await;
    let servicer = h.servicer(1).await;
    let relay = signed_relay(&servicer.public_key(), 11, 1, 1);

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/v1/client/relay"))
        .await
        .unwrap();
    ws.send(Message::Text(serde_json::to_string(&relay).unwrap()))
        .await
        .unwrap();

    let mut responses = Vec::new();
    while let Some(Ok(msg)) = ws.next().await {
        match msg {
            Message::Text(text) => {
                responses.push(serde_json::from_str::<RelayResponse>(&text).unwrap())
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    assert_eq!(responses.len(), 3);
    for (i, response) in responses.iter().enumerate() {
        response.verify().unwrap();
        assert!(response.response.ends_with(&format!("-{i}")));
    }

    // the stream is recorded as one relay
    let node = h.runtime.node(&servicer.address()).unwrap();
    assert_eq!(node.evidence.total_proofs(&h.evidence_key(1, &servicer.address())), 1);
}

#[tokio::test]
async fn test_challenge_recorded_once() {
    let h = Harness::new().await;
    let addr = serve(&h).await;
    let session = h.runtime.dispatch(h.header(1)).await.unwrap();
    let keys: Vec<_> = session.servicers[..3]
        .iter()
        .map(|a| (1..=VALIDATORS).map(validator_key).find(|k| k.address() == *a).unwrap())
        .collect();
    let answer = |i: usize, body: &str| {
        let proof = signed_relay(&keys[i].public_key(), i as i64, 1, 1).proof;
        let digest = RelayResponse::sign_hash(body, &proof).unwrap();
        RelayResponse {
            signature: keys[i].sign(&digest.0),
            response: body.to_string(),
            proof,
        }
    };
    let challenge = ChallengeProofInvalidData {
        majority_responses: vec![answer(0, "bar"), answer(1, "bar")],
        minority_response: answer(2, "baz"),
        reporter_address: validator_key(CLIENT_SEED).address(),
    };

    let client = reqwest::Client::new();
    let ack: ChallengeResponse = client
        .post(format!("http://{addr}/v1/client/challenge"))
        .json(&challenge)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ack.response, "success");

    let owner = h
        .runtime
        .nodes()
        .find(|n| session.has_servicer(&n.address()))
        .unwrap()
        .clone();
    assert_eq!(ack.servicer_pubkey, owner.public_key());
    let key = crypto::evidence_key(&h.header(1), EvidenceType::ChallengeEvidence, &owner.address())
        .unwrap();
    assert_eq!(owner.evidence.total_proofs(&key), 1);

    let resp = client
        .post(format!("http://{addr}/v1/client/challenge"))
        .json(&challenge)
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], 21);
}

#[tokio::test]
async fn test_proofs_survive_crash_after_block() {
    let dir = tempfile::tempdir().unwrap();
    let (servicer, key) = {
        let h = Harness::persistent(dir.path()).await;
        let servicer = h.servicer(1).await;
        for entropy in 0..3 {
            h.runtime
                .handle_relay(signed_relay(&servicer.public_key(), entropy, 1, 1))
                .await
                .unwrap();
        }
        h.runtime.on_new_block(1).await;
        let key = h.evidence_key(1, &servicer.address());
        // dropped without flush_all
        (servicer, key)
    };

    let storage = Storage::open(dir.path()).unwrap();
    let node = ViperNode::open(&storage, servicer).unwrap();
    assert_eq!(node.evidence.total_proofs(&key), 3);
    assert!(!node.evidence.is_sealed(&key));
}
