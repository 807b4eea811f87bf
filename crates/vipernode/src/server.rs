//! vipernode server - client RPC and background block duties

use crate::config::Config;
use crate::devnet::{DevnetChain, DevnetError, Genesis};
use crate::error::ViperError;
use crate::fisherman::{PoolError, SamplePool, TriggerAck};
use crate::interfaces::ChainHandles;
use crate::runtime::{Runtime, RuntimeError};
use crate::storage::{Storage, StorageError};
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use vipernet_core::{Address, ChainId, ChallengeProofInvalidData, ChallengeResponse, Relay, RelayProof, RelayResponse, Session, SessionHeader};
use vipernet_net::{websocket, ChainsError, HostedChains, KeyPair};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid keys file: {0}")]
    Keys(String),
    #[error(transparent)]
    Chains(#[from] ChainsError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Devnet(#[from] DevnetError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Read a JSON array of hex ed25519 seeds.
pub fn load_keys(path: impl AsRef<Path>) -> Result<Vec<KeyPair>, ServerError> {
    let raw = std::fs::read_to_string(path)?;
    let seeds: Vec<String> =
        serde_json::from_str(&raw).map_err(|e| ServerError::Keys(e.to_string()))?;
    seeds
        .iter()
        .map(|s| KeyPair::from_hex_seed(s.trim()).map_err(|e| ServerError::Keys(e.to_string())))
        .collect()
}

/// Answer to `GET /v1/health`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Health {
    pub height: u64,
    pub identities: Vec<Address>,
    pub chains: Vec<ChainId>,
    pub samplers: usize,
}

/// Server state
pub struct Server {
    config: Config,
    runtime: Arc<Runtime>,
    /// Block producer, when the node runs its own devnet
    devnet: Option<Arc<DevnetChain>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Build the runtime, devnet chain and storage from configuration.
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let keys = load_keys(&config.keys_file)?;
        let chains = HostedChains::load(&config.chains_file)?;
        let pool = match &config.sample_pool_file {
            Some(path) => SamplePool::load(path)?,
            None => SamplePool::default(),
        };
        let genesis = match &config.genesis_file {
            Some(path) => Genesis::load(path)?,
            None => {
                warn!("no genesis file given, starting an empty devnet");
                Genesis::default()
            }
        };
        let devnet = Arc::new(DevnetChain::new(genesis)?);
        let storage = Storage::open(&config.data_dir)?;
        let settings = config
            .runtime_settings()
            .map_err(|e| ServerError::Config(e.to_string()))?;
        let runtime = Runtime::new(
            settings,
            ChainHandles::from_single(devnet.clone()),
            chains,
            pool,
            storage,
            keys,
        )?;
        Ok(Self::with_runtime(config, Arc::new(runtime), Some(devnet)))
    }

    /// Wrap an existing runtime.
    pub fn with_runtime(
        config: Config,
        runtime: Arc<Runtime>,
        devnet: Option<Arc<DevnetChain>>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            runtime,
            devnet,
            shutdown_tx,
        }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Run the server on the configured address
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        self.serve(listener).await
    }

    /// Serve on `listener` until shutdown, then flush every cache.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        info!(
            addr = %listener.local_addr()?,
            identities = self.runtime.nodes().count(),
            chains = self.runtime.hosted_chains().len(),
            "vipernode listening"
        );

        let watcher = self.spawn_block_watcher();
        let producer = self.spawn_block_producer();
        let stats = self.spawn_stats_task();

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let served = axum::serve(listener, router(self.runtime.clone()))
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await;
        info!("shutting down");

        watcher.abort();
        stats.abort();
        if let Some(producer) = producer {
            producer.abort();
        }
        self.runtime.flush_all()?;
        info!("caches flushed");
        served?;
        Ok(())
    }

    /// Poll the chain height and run per-block duties on every advance.
    fn spawn_block_watcher(&self) -> JoinHandle<()> {
        let runtime = self.runtime.clone();
        let poll = Duration::from_millis(self.config.block_poll_ms);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(poll);
            let mut last = 0;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match runtime.chain().blocks.current_height().await {
                            Ok(height) if height > last => {
                                last = height;
                                runtime.on_new_block(height).await;
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "height poll failed"),
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    fn spawn_block_producer(&self) -> Option<JoinHandle<()>> {
        let devnet = self.devnet.clone()?;
        if self.config.block_time_ms == 0 {
            return None;
        }
        let block_time = Duration::from_millis(self.config.block_time_ms);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        Some(tokio::spawn(async move {
            let mut ticker = interval(block_time);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let height = devnet.produce_block();
                        debug!(height, "devnet block produced");
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        }))
    }

    fn spawn_stats_task(&self) -> JoinHandle<()> {
        let runtime = self.runtime.clone();
        let every = Duration::from_secs(self.config.stats_interval_secs);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => runtime.log_stats(),
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Sender that triggers shutdown from another task
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }
}

/// Client RPC routes
pub fn router(runtime: Arc<Runtime>) -> Router {
    Router::new()
        .route("/v1/client/relay", post(relay).get(relay_stream))
        .route("/v1/client/challenge", post(challenge))
        .route("/v1/client/dispatch", post(dispatch))
        .route("/v1/fisherman/trigger", post(trigger))
        .route("/v1/health", get(health))
        .with_state(runtime)
}

fn parse<T: DeserializeOwned>(body: &[u8]) -> Result<T, ViperError> {
    serde_json::from_slice(body).map_err(|e| ViperError::InvalidRequest(e.to_string()))
}

async fn relay(
    State(runtime): State<Arc<Runtime>>,
    body: Bytes,
) -> Result<Json<RelayResponse>, ViperError> {
    let relay: Relay = parse(&body)?;
    Ok(Json(runtime.handle_relay(relay).await?))
}

async fn challenge(
    State(runtime): State<Arc<Runtime>>,
    body: Bytes,
) -> Result<Json<ChallengeResponse>, ViperError> {
    let challenge: ChallengeProofInvalidData = parse(&body)?;
    Ok(Json(runtime.handle_challenge(challenge).await?))
}

async fn dispatch(
    State(runtime): State<Arc<Runtime>>,
    body: Bytes,
) -> Result<Json<Session>, ViperError> {
    let header: SessionHeader = parse(&body)?;
    let session = runtime.dispatch(header).await?;
    Ok(Json(session.as_ref().clone()))
}

async fn trigger(
    State(runtime): State<Arc<Runtime>>,
    body: Bytes,
) -> Result<Json<TriggerAck>, ViperError> {
    let proof: RelayProof = parse(&body)?;
    Ok(Json(runtime.trigger_fisherman(proof).await?))
}

async fn health(State(runtime): State<Arc<Runtime>>) -> Json<Health> {
    let height = match runtime.current_height().await {
        Ok(h) => h,
        Err(_) => runtime.height(),
    };
    Json(Health {
        height,
        identities: runtime.nodes().map(|n| n.address()).collect(),
        chains: runtime.hosted_chains().ids(),
        samplers: runtime.active_samplers(),
    })
}

async fn relay_stream(State(runtime): State<Arc<Runtime>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| stream_relay(runtime, socket))
}

async fn send_error(socket: &mut WebSocket, e: &ViperError) {
    if let Ok(body) = serde_json::to_string(&e.body()) {
        let _ = socket.send(Message::Text(body)).await;
    }
}

/// One streamed relay per socket: the first client frame is the relay,
/// every upstream event is answered with a signed response.
///
/// The proof is recorded once when the stream opens; later events are
/// cut off once the evidence is sealed or over its relay cap.
async fn stream_relay(runtime: Arc<Runtime>, mut socket: WebSocket) {
    let request = match socket.recv().await {
        Some(Ok(Message::Text(text))) => text,
        Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
        _ => return,
    };

    let opened = async {
        let relay: Relay = parse(request.as_bytes())?;
        let validated = runtime.validate_relay(relay).await?;
        if !validated.chain.supports_websocket() {
            return Err(ViperError::UnsupportedBlockchain(validated.chain.id.clone()));
        }
        runtime.record_relay(&validated)?;
        let events = websocket::subscribe(&validated.chain, &validated.relay.payload).await?;
        Ok::<_, ViperError>((validated, events))
    }
    .await;
    let (validated, mut events) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            debug!(code = e.code().as_u32(), error = %e, "websocket relay rejected");
            send_error(&mut socket, &e).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    runtime
        .metrics()
        .relays
        .with_label_values(&[validated.chain.id.as_str(), "ok"])
        .inc();

    let mut first = true;
    while let Some(event) = events.next().await {
        let signed = event
            .map_err(ViperError::from)
            .and_then(|body| {
                if !first {
                    validated.ensure_open()?;
                }
                validated.sign(body)
            });
        first = false;
        match signed {
            Ok(response) => {
                let Ok(text) = serde_json::to_string(&response) else {
                    error!("cannot encode relay response");
                    break;
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(code = e.code().as_u32(), error = %e, "websocket relay stopped");
                send_error(&mut socket, &e).await;
                break;
            }
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}
