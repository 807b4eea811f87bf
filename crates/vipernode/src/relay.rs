//! Relay handling: validate, record evidence, forward upstream, sign
//!
//! Validation fails fast in a fixed order; each step has its own error
//! code. Evidence is only written once every check has passed.

use crate::error::ViperError;
use crate::node::ViperNode;
use crate::runtime::Runtime;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use vipernet_core::crypto::{self, evidence_key};
use vipernet_core::*;
use vipernet_net::HostedChain;

/// A relay that passed every check
pub struct ValidatedRelay {
    pub relay: Relay,
    pub node: Arc<ViperNode>,
    pub session: Arc<Session>,
    pub header: SessionHeader,
    /// Requestor relay cap for this servicer and session
    pub max_relays: u64,
    /// Fisherman probe: served but never recorded as evidence
    pub probe: bool,
    pub chain: HostedChain,
}

impl ValidatedRelay {
    fn evidence_key(&self) -> Result<Hash32, ViperError> {
        Ok(evidence_key(
            &self.header,
            EvidenceType::RelayEvidence,
            &self.node.address(),
        )?)
    }

    /// Sealed and over-service checks before emitting a follow-up
    /// streamed event.
    pub fn ensure_open(&self) -> Result<(), ViperError> {
        if self.probe {
            return Ok(());
        }
        let key = self.evidence_key()?;
        if self.node.evidence.is_sealed(&key) {
            return Err(crate::cache::CacheError::Record(vipernet_core::Error::SealedEvidence).into());
        }
        let total = self.node.evidence.total_proofs(&key);
        if total > self.max_relays {
            return Err(crate::cache::CacheError::OverService {
                total,
                max: self.max_relays,
            }
            .into());
        }
        Ok(())
    }

    /// Sign `response` for this relay.
    pub fn sign(&self, response: String) -> Result<RelayResponse, ViperError> {
        let digest = RelayResponse::sign_hash(&response, &self.relay.proof)?;
        Ok(RelayResponse {
            signature: self.node.keypair().sign(&digest.0),
            response,
            proof: self.relay.proof.clone(),
        })
    }
}

/// True when the token is signed by its client key rather than the requestor.
fn is_self_signed(token: &Aat) -> bool {
    token.verify().is_err()
        && crypto::verify(&token.client_pubkey, &token.hash().0, &token.requestor_signature)
}

impl Runtime {
    /// Run the full validation pipeline without touching evidence.
    pub async fn validate_relay(&self, relay: Relay) -> Result<ValidatedRelay, ViperError> {
        // 1. payload
        if relay.payload.is_empty() {
            return Err(ViperError::EmptyPayload);
        }

        // 2. client height within tolerance of ours
        let height = self.current_height().await?;
        let allowance = self.settings().client_block_sync_allowance;
        let (min, max) = (height.saturating_sub(allowance), height.saturating_add(allowance));
        if relay.meta.block_height < min || relay.meta.block_height > max {
            return Err(ViperError::InvalidBlockHeight {
                got: relay.meta.block_height,
                min,
                max,
            });
        }

        // 3. request hash
        if relay.proof.request_hash != relay.request_hash()? {
            return Err(ViperError::RequestHashMismatch);
        }

        // 4. hosted chain
        let chain = self
            .hosted_chains()
            .get(&relay.proof.chain)
            .cloned()
            .ok_or_else(|| ViperError::UnsupportedBlockchain(relay.proof.chain.clone()))?;

        // 5. session boundary within the allowed lag
        let params = self.chain().staking.params(height).await?;
        let shb = relay.proof.session_block_height;
        let latest = params.session_start(height);
        let lag = self
            .settings()
            .client_session_sync_allowance
            .saturating_mul(params.blocks_per_session);
        let earliest = latest.saturating_sub(lag).max(1);
        if shb < earliest || shb > latest || params.session_start(shb) != shb {
            return Err(ViperError::InvalidBlockHeight {
                got: shb,
                min: earliest,
                max: latest,
            });
        }

        // 6. requestor
        let header = relay.proof.session_header();
        header.validate_basic()?;
        let requestor_address = header.requestor_pubkey.address();
        let requestor = self
            .chain()
            .requestors
            .get_requestor(shb, &requestor_address)
            .await?;
        if !requestor.staked {
            return Err(ViperError::Requestor(format!(
                "requestor {requestor_address} is not staked"
            )));
        }
        if !requestor.chains.contains(&header.chain) {
            return Err(ViperError::Requestor(format!(
                "requestor {requestor_address} is not staked for chain {}",
                header.chain
            )));
        }
        if !requestor.geo_zones.contains(&header.geo_zone) {
            return Err(ViperError::Requestor(format!(
                "requestor {requestor_address} is not staked for geo zone {}",
                header.geo_zone
            )));
        }
        if requestor.num_servicers != header.num_servicers {
            return Err(ViperError::InvalidSession(format!(
                "num_servicers {} does not match requestor's {}",
                header.num_servicers, requestor.num_servicers
            )));
        }

        // 7. relay cap
        let max_relays = requestor.max_possible_relays();

        // 8 + 9. route to the servicer identity, preflight evidence
        let node = self.node_by_pubkey(&relay.proof.servicer_pubkey)?;
        let probe = is_self_signed(&relay.proof.token);
        let proof = Proof::Relay(relay.proof.clone());
        if !probe {
            node.evidence
                .check_proof(&header, &node.address(), &proof, Some(max_relays))?;
        }

        // 10. session membership
        let session = node
            .sessions
            .get_or_derive(self.chain(), &header, height)
            .await?;
        if !session.has_servicer(&node.address()) {
            return Err(ViperError::NodeNotInSession(node.address()));
        }

        // 11. signatures
        if probe {
            let client = relay.proof.token.client_pubkey.address();
            if !session.has_fisherman(&client) {
                return Err(ViperError::InvalidSignature(
                    "token is not signed by the requestor".into(),
                ));
            }
        } else {
            relay
                .proof
                .token
                .verify()
                .map_err(|e| ViperError::InvalidSignature(format!("aat: {e}")))?;
        }
        relay
            .proof
            .verify_client_signature()
            .map_err(|e| ViperError::InvalidSignature(format!("client: {e}")))?;

        Ok(ValidatedRelay {
            relay,
            node,
            session,
            header,
            max_relays,
            probe,
            chain,
        })
    }

    /// Append the validated proof to the servicer's evidence.
    pub fn record_relay(&self, validated: &ValidatedRelay) -> Result<(), ViperError> {
        if validated.probe {
            debug!(
                servicer = %validated.node.address(),
                client = %validated.relay.proof.token.client_pubkey,
                "serving fisherman probe"
            );
            return Ok(());
        }
        let total = validated.node.evidence.set_proof(
            &validated.header,
            &validated.node.address(),
            Proof::Relay(validated.relay.proof.clone()),
            Some(validated.max_relays),
        )?;
        self.metrics()
            .proofs_stored
            .with_label_values(&["relay"])
            .inc();
        if total >= validated.max_relays {
            self.metrics().evidence_sealed.inc();
        }
        Ok(())
    }

    /// `POST /v1/client/relay`
    pub async fn handle_relay(&self, relay: Relay) -> Result<RelayResponse, ViperError> {
        let chain_label = relay.proof.chain.to_string();
        let outcome = self.serve_relay(relay).await;
        match &outcome {
            Ok(_) => {
                self.metrics()
                    .relays
                    .with_label_values(&[chain_label.as_str(), "ok"])
                    .inc();
            }
            Err(e) => {
                self.metrics()
                    .relays
                    .with_label_values(&[chain_label.as_str(), "error"])
                    .inc();
                let code = e.code().as_u32().to_string();
                self.metrics()
                    .relay_errors
                    .with_label_values(&[chain_label.as_str(), code.as_str()])
                    .inc();
                debug!(chain = %chain_label, code = e.code().as_u32(), error = %e, "relay rejected");
            }
        }
        outcome
    }

    async fn serve_relay(&self, relay: Relay) -> Result<RelayResponse, ViperError> {
        let validated = self.validate_relay(relay).await?;
        self.record_relay(&validated)?;

        let started = Instant::now();
        let response = self
            .upstream()
            .execute(&validated.chain, &validated.relay.payload)
            .await
            .map_err(|e| {
                warn!(chain = %validated.chain.id, error = %e, "upstream relay failed");
                e
            })?;
        self.metrics()
            .upstream_latency
            .with_label_values(&[validated.chain.id.as_str()])
            .observe(started.elapsed().as_secs_f64());

        validated.sign(response)
    }
}
