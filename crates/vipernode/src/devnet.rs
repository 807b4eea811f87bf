//! In-process development chain
//!
//! Implements every chain capability from a JSON genesis: deterministic
//! block hashes, validator snapshots per height, balances with message
//! fees, claims with expiry, QoS reports and report cards. Chain-side
//! checks reuse the validation functions of the claim and report modules.

use crate::claims::{proof_height, validate_claim, validate_proof_message, ClaimError};
use crate::error::ErrorCode;
use crate::interfaces::{BlockSource, ChainError, ChainTx, Requestors, Staking};
use crate::reports::{report_reveal_height, validate_qos_report, ReportError};
use crate::session::{select_session, SessionInputs};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vipernet_core::crypto;
use vipernet_core::msgs::{
    MsgClaim, MsgProof, MsgSubmitQosReport, CLAIM_FEE, PROOF_FEE, QOS_REPORT_FEE,
};
use vipernet_core::*;

#[derive(Debug, Error)]
pub enum DevnetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("genesis json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid genesis: {0}")]
    Invalid(String),
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisValidator {
    pub pubkey: PublicKey,
    pub service_url: String,
    pub chains: Vec<ChainId>,
    pub geo_zones: Vec<GeoZoneId>,
    #[serde(default = "yes")]
    pub staked: bool,
    #[serde(default)]
    pub jailed: bool,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub report_card: ReportCard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisRequestor {
    pub pubkey: PublicKey,
    pub chains: Vec<ChainId>,
    pub geo_zones: Vec<GeoZoneId>,
    pub max_relays: u64,
    pub num_servicers: u32,
    #[serde(default = "yes")]
    pub staked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisBalance {
    pub address: Address,
    pub amount: u64,
}

/// Initial devnet state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Genesis {
    pub chain_id: String,
    /// Height of the first block
    pub initial_height: u64,
    pub params: ProtocolParams,
    pub validators: Vec<GenesisValidator>,
    pub requestors: Vec<GenesisRequestor>,
    /// Explicit balances; every other actor starts with `default_balance`
    pub balances: Vec<GenesisBalance>,
    pub default_balance: u64,
    /// Base units minted per proven relay at a perfect report card
    pub reward_per_proof: u64,
    pub challenge_burn: u64,
    pub no_activity_burn: u64,
    pub fisherman_slash: u64,
}

impl Default for Genesis {
    fn default() -> Self {
        Self {
            chain_id: "vipernet-devnet".to_string(),
            initial_height: 1,
            params: ProtocolParams::default(),
            validators: Vec::new(),
            requestors: Vec::new(),
            balances: Vec::new(),
            default_balance: 1_000_000_000,
            reward_per_proof: 1_000,
            challenge_burn: 100_000,
            no_activity_burn: 50_000,
            fisherman_slash: 100_000,
        }
    }
}

impl Genesis {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DevnetError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Notable state transitions, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    ClaimAccepted { from: Address, session: u64, total_proofs: u64 },
    ClaimExpired { from: Address, session: u64 },
    ProofAccepted { from: Address, session: u64, reward: u64 },
    ReplayBurned { address: Address, amount: u64 },
    ChallengeBurned { address: Address, amount: u64 },
    Paused { address: Address },
    BurnedNoActivity { address: Address, amount: u64 },
    FishermanSlashed { address: Address, amount: u64 },
    QosReportAccepted { fisherman: Address, servicer: Address, session: u64 },
    ReportCardUpdated { address: Address, session: u64 },
}

type ValidatorSet = Arc<BTreeMap<Address, Validator>>;
type ClaimKey = (Address, Hash32, EvidenceType);

struct ChainState {
    height: u64,
    hashes: BTreeMap<u64, Hash32>,
    /// Validator set effective from each height onward
    validators: BTreeMap<u64, ValidatorSet>,
    requestors: BTreeMap<Address, Requestor>,
    balances: HashMap<Address, u64>,
    claims: HashMap<ClaimKey, MsgClaim>,
    /// Claims proved or slashed; never claimable again
    settled: HashSet<ClaimKey>,
    qos_reports: HashMap<(Hash32, Address), MsgSubmitQosReport>,
    applied_cards: HashSet<(Hash32, Address)>,
    events: Vec<ChainEvent>,
}

impl ChainState {
    fn validators_at(&self, height: u64) -> ValidatorSet {
        self.validators
            .range(..=height)
            .next_back()
            .or_else(|| self.validators.iter().next())
            .map(|(_, set)| set.clone())
            .unwrap_or_default()
    }

    fn validator_at(&self, height: u64, address: &Address) -> Result<Validator, ChainError> {
        self.validators_at(height)
            .get(address)
            .cloned()
            .ok_or(ChainError::ValidatorNotFound(*address))
    }

    /// Apply `f` to the validator set from the current height on.
    fn update_validator(
        &mut self,
        address: &Address,
        f: impl FnOnce(&mut Validator) -> Result<(), ChainError>,
    ) -> Result<(), ChainError> {
        let mut set = (*self.validators_at(self.height)).clone();
        let validator = set
            .get_mut(address)
            .ok_or(ChainError::ValidatorNotFound(*address))?;
        f(validator)?;
        self.validators.insert(self.height, Arc::new(set));
        Ok(())
    }

    fn balance_mut(&mut self, address: &Address, default: u64) -> &mut u64 {
        self.balances.entry(*address).or_insert(default)
    }

    fn burn(&mut self, address: &Address, amount: u64, default: u64) -> u64 {
        let balance = self.balance_mut(address, default);
        let burned = amount.min(*balance);
        *balance -= burned;
        burned
    }
}

/// Single-process chain for development and tests
pub struct DevnetChain {
    genesis: Genesis,
    state: RwLock<ChainState>,
    height_tx: watch::Sender<u64>,
}

fn rejected(code: ErrorCode, reason: impl Into<String>) -> ChainError {
    ChainError::Rejected {
        code,
        reason: reason.into(),
    }
}

impl From<ClaimError> for ChainError {
    fn from(e: ClaimError) -> Self {
        match e {
            ClaimError::Chain(inner) => inner,
            other => rejected(other.code(), other.to_string()),
        }
    }
}

impl From<ReportError> for ChainError {
    fn from(e: ReportError) -> Self {
        match e {
            ReportError::Chain(inner) => inner,
            other => rejected(other.code(), other.to_string()),
        }
    }
}

impl DevnetChain {
    pub fn new(genesis: Genesis) -> Result<Self, DevnetError> {
        if genesis.initial_height == 0 {
            return Err(DevnetError::Invalid("initial_height must be positive".into()));
        }
        if genesis.params.blocks_per_session == 0 {
            return Err(DevnetError::Invalid(
                "blocks_per_session must be positive".into(),
            ));
        }

        let mut validators = BTreeMap::new();
        for v in &genesis.validators {
            let address = v.pubkey.address();
            let validator = Validator {
                address,
                pubkey: v.pubkey,
                service_url: v.service_url.clone(),
                chains: v.chains.clone(),
                geo_zones: v.geo_zones.clone(),
                staked: v.staked,
                jailed: v.jailed,
                paused: v.paused,
                report_card: v.report_card,
            };
            if validators.insert(address, validator).is_some() {
                return Err(DevnetError::Invalid(format!("validator {address} listed twice")));
            }
        }
        let mut requestors = BTreeMap::new();
        for r in &genesis.requestors {
            let address = r.pubkey.address();
            if r.num_servicers == 0 || r.chains.is_empty() {
                return Err(DevnetError::Invalid(format!(
                    "requestor {address} needs chains and num_servicers"
                )));
            }
            requestors.insert(
                address,
                Requestor {
                    address,
                    pubkey: r.pubkey,
                    chains: r.chains.clone(),
                    geo_zones: r.geo_zones.clone(),
                    max_relays: r.max_relays,
                    num_servicers: r.num_servicers,
                    staked: r.staked,
                },
            );
        }
        let balances = genesis
            .balances
            .iter()
            .map(|b| (b.address, b.amount))
            .collect();

        let height = genesis.initial_height;
        let mut hashes = BTreeMap::new();
        hashes.insert(height, block_hash_for(&genesis.chain_id, height, &Hash32([0; 32])));
        let mut snapshots = BTreeMap::new();
        snapshots.insert(height, Arc::new(validators));

        info!(
            chain_id = %genesis.chain_id,
            height,
            validators = genesis.validators.len(),
            requestors = genesis.requestors.len(),
            "devnet genesis loaded"
        );
        let (height_tx, _) = watch::channel(height);
        Ok(Self {
            state: RwLock::new(ChainState {
                height,
                hashes,
                validators: snapshots,
                requestors,
                balances,
                claims: HashMap::new(),
                settled: HashSet::new(),
                qos_reports: HashMap::new(),
                applied_cards: HashSet::new(),
                events: Vec::new(),
            }),
            genesis,
            height_tx,
        })
    }

    pub fn genesis(&self) -> &Genesis {
        &self.genesis
    }

    pub fn height(&self) -> u64 {
        self.state.read().height
    }

    /// Produce the next block. Expired claims are dropped.
    pub fn produce_block(&self) -> u64 {
        let height = {
            let mut state = self.state.write();
            let prev = state
                .hashes
                .get(&state.height)
                .copied()
                .unwrap_or(Hash32([0; 32]));
            state.height += 1;
            let height = state.height;
            let hash = block_hash_for(&self.genesis.chain_id, height, &prev);
            state.hashes.insert(height, hash);

            let expired: Vec<ClaimKey> = state
                .claims
                .iter()
                .filter(|(_, c)| height > c.expiration_height)
                .map(|(k, _)| *k)
                .collect();
            for key in expired {
                if let Some(claim) = state.claims.remove(&key) {
                    debug!(from = %claim.from_address, session = claim.header.session_block_height, "claim expired");
                    state.events.push(ChainEvent::ClaimExpired {
                        from: claim.from_address,
                        session: claim.header.session_block_height,
                    });
                }
            }
            height
        };
        self.height_tx.send_replace(height);
        height
    }

    /// Produce blocks until `height` is reached.
    pub fn advance_to(&self, height: u64) -> u64 {
        while self.height() < height {
            self.produce_block();
        }
        self.height()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.height_tx.subscribe()
    }

    pub fn events(&self) -> Vec<ChainEvent> {
        self.state.read().events.clone()
    }

    pub fn balance(&self, address: &Address) -> u64 {
        self.state
            .read()
            .balances
            .get(address)
            .copied()
            .unwrap_or(self.genesis.default_balance)
    }

    /// Devnet faucet: credit `amount` to `address`.
    pub fn mint(&self, address: &Address, amount: u64) -> u64 {
        let mut state = self.state.write();
        let balance = state.balance_mut(address, self.genesis.default_balance);
        *balance = balance.saturating_add(amount);
        debug!(%address, amount, balance = *balance, "minted");
        *balance
    }

    /// Latest view of a validator
    pub fn validator(&self, address: &Address) -> Option<Validator> {
        let state = self.state.read();
        state.validator_at(state.height, address).ok()
    }

    pub fn claim(&self, from: &Address, header: &SessionHeader, evidence_type: EvidenceType) -> Option<MsgClaim> {
        let key = (*from, header.hash().ok()?, evidence_type);
        self.state.read().claims.get(&key).cloned()
    }

    fn charge_fee(&self, state: &mut ChainState, signer: &Address, fee: u64) -> Result<(), ChainError> {
        let balance = state.balance_mut(signer, self.genesis.default_balance);
        if *balance < fee {
            return Err(ChainError::InsufficientFunds {
                address: *signer,
                needed: fee,
                available: *balance,
            });
        }
        *balance -= fee;
        Ok(())
    }

    fn reward(&self, card: &ReportCard, num_relays: u64) -> Result<u64, ChainError> {
        let base = self.genesis.reward_per_proof.saturating_mul(num_relays);
        let Some(avg) = card.average() else {
            return Ok(base);
        };
        let factor = avg
            .latency
            .checked_add(avg.availability)
            .and_then(|s| s.checked_add(avg.reliability))
            .map(|s| s.div_int(3).clamp_unit())
            .map_err(|e| ChainError::Unavailable(e.to_string()))?;
        let scaled = (base as u128).saturating_mul(factor.raw()) / Dec::one().raw();
        Ok(scaled as u64)
    }

    fn apply_report_card(
        state: &mut ChainState,
        header: &SessionHeader,
        address: &Address,
        scores: &QosScores,
    ) -> Result<bool, ChainError> {
        let session = header.hash().map_err(|e| ChainError::Unavailable(e.to_string()))?;
        if !state.applied_cards.insert((session, *address)) {
            return Ok(false);
        }
        state.update_validator(address, |v| {
            v.report_card
                .apply(scores)
                .map_err(|e| ChainError::Unavailable(e.to_string()))
        })?;
        state.events.push(ChainEvent::ReportCardUpdated {
            address: *address,
            session: header.session_block_height,
        });
        Ok(true)
    }

    /// Session as the chain derives it, from snapshot state.
    fn derive_session(state: &ChainState, header: &SessionHeader, params: &ProtocolParams) -> Result<Session, ChainError> {
        let shb = header.session_block_height;
        let block_hash = state.hashes.get(&shb).copied().ok_or(ChainError::BlockNotFound(shb))?;
        let validators: Vec<Validator> = state
            .validators_at(shb)
            .values()
            .filter(|v| v.serves_chain(&header.chain))
            .cloned()
            .collect();
        let now = state.validators_at(state.height);
        let inactive_now = validators
            .iter()
            .filter(|v| now.get(&v.address).map_or(true, |n| !n.is_active()))
            .map(|v| v.address)
            .collect();
        select_session(&SessionInputs {
            header: header.clone(),
            block_hash,
            validators,
            inactive_now,
            fisherman_count: params.fisherman_count,
        })
        .map_err(|e| rejected(e.code(), e.to_string()))
    }
}

fn block_hash_for(chain_id: &str, height: u64, prev: &Hash32) -> Hash32 {
    crypto::hash_parts(&[chain_id.as_bytes(), &height.to_be_bytes(), &prev.0])
}

#[async_trait]
impl BlockSource for DevnetChain {
    async fn current_height(&self) -> Result<u64, ChainError> {
        Ok(self.height())
    }

    async fn block_hash(&self, height: u64) -> Result<Hash32, ChainError> {
        self.state
            .read()
            .hashes
            .get(&height)
            .copied()
            .ok_or(ChainError::BlockNotFound(height))
    }
}

#[async_trait]
impl Staking for DevnetChain {
    async fn params(&self, _height: u64) -> Result<ProtocolParams, ChainError> {
        Ok(self.genesis.params.clone())
    }

    async fn validators_by_chain(&self, height: u64, chain: &ChainId) -> Result<Vec<Address>, ChainError> {
        Ok(self
            .state
            .read()
            .validators_at(height)
            .values()
            .filter(|v| v.staked && v.serves_chain(chain))
            .map(|v| v.address)
            .collect())
    }

    async fn validators_by_geo_zone(
        &self,
        height: u64,
        geo_zone: &GeoZoneId,
    ) -> Result<Vec<Address>, ChainError> {
        Ok(self
            .state
            .read()
            .validators_at(height)
            .values()
            .filter(|v| v.staked && v.serves_geo_zone(geo_zone))
            .map(|v| v.address)
            .collect())
    }

    async fn get_validator(&self, height: u64, address: &Address) -> Result<Validator, ChainError> {
        self.state.read().validator_at(height, address)
    }

    async fn reward_for_relays(
        &self,
        report_card: &ReportCard,
        num_relays: u64,
        _servicer: &Address,
        _requestor: &Address,
    ) -> Result<u64, ChainError> {
        self.reward(report_card, num_relays)
    }

    async fn burn_for_challenge(&self, servicer: &Address) -> Result<(), ChainError> {
        let mut state = self.state.write();
        let amount = state.burn(servicer, self.genesis.challenge_burn, self.genesis.default_balance);
        state.events.push(ChainEvent::ChallengeBurned {
            address: *servicer,
            amount,
        });
        Ok(())
    }

    async fn pause_node(&self, address: &Address) -> Result<(), ChainError> {
        let mut state = self.state.write();
        state.update_validator(address, |v| {
            v.paused = true;
            Ok(())
        })?;
        state.events.push(ChainEvent::Paused { address: *address });
        warn!(validator = %address, "validator paused");
        Ok(())
    }

    async fn slash_fisherman(&self, address: &Address) -> Result<(), ChainError> {
        let mut state = self.state.write();
        let amount = state.burn(address, self.genesis.fisherman_slash, self.genesis.default_balance);
        state.events.push(ChainEvent::FishermanSlashed {
            address: *address,
            amount,
        });
        Ok(())
    }

    async fn burn_for_no_activity(&self, address: &Address) -> Result<(), ChainError> {
        let mut state = self.state.write();
        let amount = state.burn(address, self.genesis.no_activity_burn, self.genesis.default_balance);
        state.events.push(ChainEvent::BurnedNoActivity {
            address: *address,
            amount,
        });
        Ok(())
    }

    async fn update_validator_report_card(
        &self,
        header: &SessionHeader,
        address: &Address,
        scores: &QosScores,
    ) -> Result<(), ChainError> {
        let mut state = self.state.write();
        Self::apply_report_card(&mut state, header, address, scores)?;
        Ok(())
    }
}

#[async_trait]
impl Requestors for DevnetChain {
    async fn get_requestor(&self, _height: u64, address: &Address) -> Result<Requestor, ChainError> {
        self.state
            .read()
            .requestors
            .get(address)
            .cloned()
            .ok_or(ChainError::RequestorNotFound(*address))
    }
}

#[async_trait]
impl ChainTx for DevnetChain {
    async fn submit_claim(&self, signer: &Address, msg: MsgClaim) -> Result<(), ChainError> {
        let params = &self.genesis.params;
        let mut state = self.state.write();
        self.charge_fee(&mut state, signer, CLAIM_FEE)?;
        if *signer != msg.from_address {
            return Err(rejected(ErrorCode::InvalidClaim, "signer is not the claimant"));
        }
        validate_claim(&msg, params, state.height)?;
        let servicer = state.validator_at(msg.header.session_block_height, signer)?;
        if !servicer.serves_chain(&msg.header.chain) {
            return Err(rejected(
                ErrorCode::InvalidClaim,
                format!("{signer} does not serve chain {}", msg.header.chain),
            ));
        }

        let key = (*signer, msg.header.hash().map_err(ClaimError::from)?, msg.evidence_type);
        if state.claims.contains_key(&key) || state.settled.contains(&key) {
            return Err(rejected(ErrorCode::InvalidClaim, "claim already exists"));
        }
        let mut claim = msg;
        claim.expiration_height = state.height + params.claim_expiration * params.blocks_per_session;
        state.events.push(ChainEvent::ClaimAccepted {
            from: *signer,
            session: claim.header.session_block_height,
            total_proofs: claim.total_proofs,
        });
        info!(from = %signer, session = claim.header.session_block_height, proofs = claim.total_proofs, "claim accepted");
        state.claims.insert(key, claim);
        Ok(())
    }

    async fn submit_proof(&self, signer: &Address, msg: MsgProof) -> Result<(), ChainError> {
        let params = &self.genesis.params;
        let mut state = self.state.write();
        self.charge_fee(&mut state, signer, PROOF_FEE)?;

        let header = msg.header();
        let key = (*signer, header.hash().map_err(ClaimError::from)?, msg.claim_evidence_type);
        let claim = state
            .claims
            .get(&key)
            .cloned()
            .ok_or_else(|| ChainError::from(ClaimError::ClaimNotFound))?;
        let reveal = proof_height(&claim.header, params);
        let reveal_hash = state
            .hashes
            .get(&reveal)
            .copied()
            .ok_or_else(|| rejected(ErrorCode::InvalidProofs, format!("reveal height {reveal} not reached")))?;
        let servicer = state.validator_at(claim.header.session_block_height, signer)?;
        let report = state
            .qos_reports
            .get(&(key.1, *signer))
            .cloned();

        if let Err(e) = validate_proof_message(&msg, &claim, &reveal_hash, &servicer, report.as_ref()) {
            let code = e.code();
            if code.deletes_evidence() {
                state.claims.remove(&key);
                state.settled.insert(key);
            }
            if code == ErrorCode::ReplayAttack {
                let amount = params.replay_attack_burn_multiplier.saturating_mul(claim.total_proofs);
                let burned = state.burn(signer, amount, self.genesis.default_balance);
                state.events.push(ChainEvent::ReplayBurned {
                    address: *signer,
                    amount: burned,
                });
                warn!(servicer = %signer, burned, "replay attack burned");
            }
            return Err(e.into());
        }

        state.claims.remove(&key);
        state.settled.insert(key);
        let reward = match &msg.claim_leaf {
            Proof::Relay(_) => {
                if let Some(report) = &report {
                    Self::apply_report_card(&mut state, &claim.header, signer, &report.report.scores())?;
                }
                let card = state.validator_at(state.height, signer)?.report_card;
                let reward = self.reward(&card, claim.total_proofs)?;
                *state.balance_mut(signer, self.genesis.default_balance) += reward;
                reward
            }
            Proof::Challenge(challenge) => {
                let minority = challenge.minority_response.proof.servicer_pubkey.address();
                let amount = state.burn(&minority, self.genesis.challenge_burn, self.genesis.default_balance);
                state.events.push(ChainEvent::ChallengeBurned {
                    address: minority,
                    amount,
                });
                0
            }
        };
        state.events.push(ChainEvent::ProofAccepted {
            from: *signer,
            session: claim.header.session_block_height,
            reward,
        });
        info!(from = %signer, session = claim.header.session_block_height, reward, "proof accepted");
        Ok(())
    }

    async fn submit_qos_report(&self, signer: &Address, msg: MsgSubmitQosReport) -> Result<(), ChainError> {
        let params = &self.genesis.params;
        let mut state = self.state.write();
        self.charge_fee(&mut state, signer, QOS_REPORT_FEE)?;
        if *signer != msg.fisherman_address {
            return Err(rejected(ErrorCode::InvalidSignature, "signer is not the fisherman"));
        }
        let session_hash = msg.header.hash().map_err(ReportError::from)?;
        let report_key = (session_hash, msg.servicer_address);
        if state.qos_reports.contains_key(&report_key) {
            return Err(rejected(ErrorCode::InvalidClaim, "report already submitted"));
        }

        let fisherman = state.validator_at(state.height, signer)?;
        let session = Self::derive_session(&state, &msg.header, params)?;
        let reveal = report_reveal_height(&msg.header, params);
        let reveal_hash = state.hashes.get(&reveal).copied().ok_or(ChainError::BlockNotFound(reveal))?;

        if let Err(e) = validate_qos_report(&msg, &fisherman.pubkey, &session, params, state.height, &reveal_hash) {
            if e.code().deletes_evidence() {
                let mut penalized = msg.clone();
                penalized.report.latency_score = Dec::one();
                penalized.report.availability_score = Dec::one();
                penalized.report.reliability_score = Dec::one();
                state.qos_reports.insert(report_key, penalized);
                let amount = state.burn(signer, self.genesis.fisherman_slash, self.genesis.default_balance);
                state.events.push(ChainEvent::FishermanSlashed {
                    address: *signer,
                    amount,
                });
                warn!(fisherman = %signer, "invalid sample proof, fisherman slashed");
            }
            return Err(e.into());
        }

        state.events.push(ChainEvent::QosReportAccepted {
            fisherman: *signer,
            servicer: msg.servicer_address,
            session: msg.header.session_block_height,
        });
        info!(fisherman = %signer, servicer = %msg.servicer_address, "qos report accepted");
        state.qos_reports.insert(report_key, msg);
        Ok(())
    }

    async fn get_claim(
        &self,
        from: &Address,
        header: &SessionHeader,
        evidence_type: EvidenceType,
    ) -> Result<Option<MsgClaim>, ChainError> {
        let key = (*from, header.hash().map_err(ClaimError::from)?, evidence_type);
        Ok(self.state.read().claims.get(&key).cloned())
    }

    async fn get_qos_report(
        &self,
        header: &SessionHeader,
        servicer: &Address,
    ) -> Result<Option<MsgSubmitQosReport>, ChainError> {
        let key = (header.hash().map_err(ReportError::from)?, *servicer);
        Ok(self.state.read().qos_reports.get(&key).cloned())
    }
}
