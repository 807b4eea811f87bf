#![allow(dead_code)]

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::routing::get;
use axum::Router;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use vipernet_core::*;
use vipernet_net::{HostedChain, HostedChains, KeyPair};
use vipernode::devnet::{DevnetChain, Genesis, GenesisRequestor, GenesisValidator};
use vipernode::fisherman::SamplePool;
use vipernode::{ChainHandles, Runtime, RuntimeSettings, Storage};

pub const VALIDATORS: u8 = 6;
pub const REQUESTOR_SEED: u8 = 100;
pub const CLIENT_SEED: u8 = 101;

pub fn chain_id() -> ChainId {
    ChainId::new("0001").unwrap()
}

pub fn geo_zone() -> GeoZoneId {
    GeoZoneId::new("0001").unwrap()
}

pub fn validator_key(i: u8) -> KeyPair {
    KeyPair::from_seed(&[i; 32])
}

/// Six validators on chain 0001, one requestor buying 10M relays over five
/// servicers.
pub fn genesis() -> Genesis {
    Genesis {
        validators: (1..=VALIDATORS)
            .map(|i| GenesisValidator {
                pubkey: validator_key(i).public_key(),
                service_url: "http://127.0.0.1:1".into(),
                chains: vec![chain_id()],
                geo_zones: vec![geo_zone()],
                staked: true,
                jailed: false,
                paused: false,
                report_card: ReportCard::default(),
            })
            .collect(),
        requestors: vec![GenesisRequestor {
            pubkey: KeyPair::from_seed(&[REQUESTOR_SEED; 32]).public_key(),
            chains: vec![chain_id()],
            geo_zones: vec![geo_zone()],
            max_relays: 10_000_000,
            num_servicers: 5,
            staked: true,
        }],
        ..Genesis::default()
    }
}

/// Upstream chain answering "bar" to every request.
pub async fn spawn_upstream() -> String {
    let app = Router::new().fallback(|| async { "bar" });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}")
}

/// Websocket upstream pushing three events per subscription.
pub async fn spawn_ws_upstream() -> String {
    let app = Router::new().route(
        "/ws",
        get(|ws: WebSocketUpgrade| async move {
            ws.on_upgrade(|mut socket| async move {
                if let Some(Ok(Message::Text(req))) = socket.recv().await {
                    for i in 0..3 {
                        let _ = socket.send(Message::Text(format!("{req}-{i}"))).await;
                    }
                }
                let _ = socket.send(Message::Close(None)).await;
            })
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("ws://{addr}/ws")
}

/// Devnet plus a lean-mode runtime hosting every genesis validator.
pub struct Harness {
    pub devnet: Arc<DevnetChain>,
    pub runtime: Arc<Runtime>,
    pub upstream: String,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with(RuntimeSettings::default(), None).await
    }

    pub async fn with(settings: RuntimeSettings, websocket_url: Option<String>) -> Self {
        Self::build(settings, websocket_url, SamplePool::default()).await
    }

    pub async fn build(
        settings: RuntimeSettings,
        websocket_url: Option<String>,
        pool: SamplePool,
    ) -> Self {
        Self::with_genesis(genesis(), settings, websocket_url, pool).await
    }

    pub async fn with_genesis(
        genesis: Genesis,
        settings: RuntimeSettings,
        websocket_url: Option<String>,
        pool: SamplePool,
    ) -> Self {
        let storage = Storage::temporary().unwrap();
        Self::assemble(genesis, settings, websocket_url, pool, storage).await
    }

    /// Default harness over an on-disk database at `path`.
    pub async fn persistent(path: &Path) -> Self {
        let storage = Storage::open(path).unwrap();
        Self::assemble(
            genesis(),
            RuntimeSettings::default(),
            None,
            SamplePool::default(),
            storage,
        )
        .await
    }

    async fn assemble(
        genesis: Genesis,
        settings: RuntimeSettings,
        websocket_url: Option<String>,
        pool: SamplePool,
        storage: Storage,
    ) -> Self {
        let upstream = spawn_upstream().await;
        let devnet = Arc::new(DevnetChain::new(genesis).unwrap());
        let chains = HostedChains::new(vec![HostedChain {
            id: chain_id(),
            url: upstream.clone(),
            websocket_url,
            basic_auth: None,
        }])
        .unwrap();
        let runtime = Runtime::new(
            settings,
            ChainHandles::from_single(devnet.clone()),
            chains,
            pool,
            storage,
            (1..=VALIDATORS).map(validator_key).collect(),
        )
        .unwrap();
        Self {
            devnet,
            runtime: Arc::new(runtime),
            upstream,
        }
    }

    pub fn header(&self, session_block_height: u64) -> SessionHeader {
        SessionHeader {
            requestor_pubkey: KeyPair::from_seed(&[REQUESTOR_SEED; 32]).public_key(),
            chain: chain_id(),
            geo_zone: geo_zone(),
            num_servicers: 5,
            session_block_height,
        }
    }

    /// First servicer of the session as a local key.
    pub async fn servicer(&self, session_block_height: u64) -> KeyPair {
        let session = self
            .runtime
            .dispatch(self.header(session_block_height))
            .await
            .unwrap();
        let first = session.servicers[0];
        (1..=VALIDATORS)
            .map(validator_key)
            .find(|k| k.address() == first)
            .unwrap()
    }

    pub fn evidence_key(&self, session_block_height: u64, servicer: &Address) -> Hash32 {
        crypto::evidence_key(
            &self.header(session_block_height),
            EvidenceType::RelayEvidence,
            servicer,
        )
        .unwrap()
    }
}

/// A relay signed by the test client under the requestor's token.
pub fn signed_relay(
    servicer: &PublicKey,
    entropy: i64,
    block_height: u64,
    session_block_height: u64,
) -> Relay {
    let requestor = KeyPair::from_seed(&[REQUESTOR_SEED; 32]);
    let client = KeyPair::from_seed(&[CLIENT_SEED; 32]);
    let mut token = Aat {
        version: AAT_VERSION.into(),
        requestor_pubkey: requestor.public_key(),
        client_pubkey: client.public_key(),
        requestor_signature: Signature([0; 64]),
    };
    token.requestor_signature = requestor.sign(&token.hash().0);

    let payload = RelayPayload {
        data: r#"{"jsonrpc":"2.0","method":"foo","id":1}"#.into(),
        ..Default::default()
    };
    let meta = RelayMeta { block_height };
    let mut proof = RelayProof {
        entropy,
        request_hash: compute_request_hash(&payload, &meta).unwrap(),
        session_block_height,
        servicer_pubkey: *servicer,
        chain: chain_id(),
        geo_zone: geo_zone(),
        num_servicers: 5,
        token,
        signature: Signature([0; 64]),
    };
    proof.signature = client.sign(&proof.hash().unwrap().0);
    Relay {
        payload,
        meta,
        proof,
    }
}
