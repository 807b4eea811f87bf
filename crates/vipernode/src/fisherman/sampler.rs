//! Background sampling loop of one fisherman over one session

use crate::fisherman::availability::AvailabilityMonitor;
use crate::interfaces::ChainHandles;
use crate::metrics::Metrics;
use crate::node::ViperNode;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vipernet_core::*;
use vipernet_net::{HostedChain, UpstreamClient};

/// Randomized delays of the sampling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerTiming {
    /// Delay before the first round, `(min, max)`
    pub start_delay: (Duration, Duration),
    /// Pause between rounds, `(min, max)`
    pub interval: (Duration, Duration),
}

impl Default for SamplerTiming {
    fn default() -> Self {
        Self {
            start_delay: (Duration::from_secs(5), Duration::from_secs(8)),
            interval: (Duration::from_secs(15), Duration::from_secs(35)),
        }
    }
}

impl SamplerTiming {
    pub fn start_delay(&self) -> Duration {
        pick(self.start_delay)
    }

    pub fn interval(&self) -> Duration {
        pick(self.interval)
    }
}

fn pick((min, max): (Duration, Duration)) -> Duration {
    if max <= min {
        return min;
    }
    rand::thread_rng().gen_range(min..=max)
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Totals reported when a sampler exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplerSummary {
    pub rounds: u64,
    pub samples: u64,
    pub penalties: u64,
}

/// Everything a sampling task needs, detached from the runtime
pub struct Sampler {
    pub chain: ChainHandles,
    pub upstream: UpstreamClient,
    /// The fisherman's own endpoint for the session chain
    pub local_chain: HostedChain,
    pub payloads: Vec<RelayPayload>,
    pub node: Arc<ViperNode>,
    pub session: Arc<Session>,
    pub session_end: u64,
    pub timing: SamplerTiming,
    pub metrics: Metrics,
    pub heights: watch::Receiver<u64>,
}

impl Sampler {
    fn session_over(&self) -> bool {
        *self.heights.borrow() > self.session_end
    }

    /// Sleep for `duration` unless the session ends first.
    ///
    /// Returns false once the loop should stop.
    async fn wait(&mut self, duration: Duration) -> bool {
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        loop {
            if self.session_over() {
                return false;
            }
            tokio::select! {
                _ = &mut sleep => return !self.session_over(),
                changed = self.heights.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Sample every servicer of the session until it ends.
    pub async fn run(mut self) -> SamplerSummary {
        let mut summary = SamplerSummary::default();
        let mut monitor = AvailabilityMonitor::new();
        info!(
            fisherman = %self.node.address(),
            chain = %self.session.header.chain,
            session = self.session.header.session_block_height,
            servicers = self.session.servicers.len(),
            "fisherman sampler started"
        );

        let delay = self.timing.start_delay();
        if self.wait(delay).await {
            loop {
                let (samples, penalties) = self.sample_round(&mut monitor).await;
                summary.rounds += 1;
                summary.samples += samples;
                summary.penalties += penalties;
                let interval = self.timing.interval();
                if !self.wait(interval).await {
                    break;
                }
            }
        }

        info!(
            fisherman = %self.node.address(),
            session = self.session.header.session_block_height,
            rounds = summary.rounds,
            samples = summary.samples,
            penalties = summary.penalties,
            "fisherman sampler finished"
        );
        summary
    }

    /// Probe each servicer once. Returns (samples recorded, penalties).
    pub async fn sample_round(&self, monitor: &mut AvailabilityMonitor) -> (u64, u64) {
        let mut samples = 0;
        let mut penalties = 0;
        for servicer in &self.session.servicers {
            let Some(result) = self.probe(servicer).await else {
                continue;
            };
            let available = result.is_available;
            self.metrics
                .samples
                .with_label_values(&[if available { "true" } else { "false" }])
                .inc();
            self.metrics
                .sample_latency
                .observe(result.latency.as_secs_f64());

            if monitor.record(servicer, available) {
                penalties += 1;
                self.penalize(servicer).await;
            }
            match self.node.results.add_result(&self.session.header, result) {
                Ok(_) => samples += 1,
                Err(e) => warn!(servicer = %servicer, error = %e, "test result not recorded"),
            }
        }
        (samples, penalties)
    }

    async fn penalize(&self, servicer: &Address) {
        warn!(
            servicer = %servicer,
            fisherman = %self.node.address(),
            "servicer unavailable for a full window, penalizing"
        );
        self.metrics.penalties.inc();
        if let Err(e) = self.chain.staking.pause_node(servicer).await {
            warn!(servicer = %servicer, error = %e, "pause failed");
        }
        if let Err(e) = self.chain.staking.burn_for_no_activity(servicer).await {
            warn!(servicer = %servicer, error = %e, "no-activity burn failed");
        }
    }

    /// One probe relay plus the matching local execution.
    async fn probe(&self, servicer: &Address) -> Option<TestResult> {
        let height = *self.heights.borrow();
        let payload = {
            let mut rng = rand::thread_rng();
            let index = rng.gen_range(0..self.payloads.len().max(1));
            self.payloads.get(index)?.clone()
        };
        let validator = match self.chain.staking.get_validator(height, servicer).await {
            Ok(v) => v,
            Err(e) => {
                debug!(servicer = %servicer, error = %e, "cannot look up servicer");
                return None;
            }
        };
        let relay = match self.build_probe(&validator.pubkey, &payload, height) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "failed to build probe relay");
                return None;
            }
        };

        let started = Instant::now();
        let remote = self.upstream.send_relay(&validator.service_url, &relay).await;
        let latency = started.elapsed();
        let remote = match remote {
            Ok(response) if response.verify().is_ok() => Some(response.response),
            Ok(_) => {
                debug!(servicer = %servicer, "probe response signature invalid");
                None
            }
            Err(e) => {
                debug!(servicer = %servicer, error = %e, "probe relay failed");
                None
            }
        };
        let local = self.upstream.execute(&self.local_chain, &payload).await.ok();

        let is_available = remote.is_some();
        let is_reliable = match (&remote, &local) {
            (Some(r), Some(l)) => r == l,
            _ => false,
        };
        Some(TestResult {
            servicer_address: *servicer,
            timestamp_ms: unix_millis(),
            latency,
            is_available,
            is_reliable,
        })
    }

    /// Relay signed entirely by the fisherman key.
    ///
    /// The token names the session requestor but carries the fisherman's
    /// own signature; servicers accept it only from session fishermen.
    pub fn build_probe(
        &self,
        servicer_pubkey: &PublicKey,
        payload: &RelayPayload,
        height: u64,
    ) -> vipernet_core::Result<Relay> {
        build_probe_relay(&self.node, &self.session.header, servicer_pubkey, payload, height)
    }
}

/// Build a fisherman-signed probe relay for `header`.
pub fn build_probe_relay(
    fisherman: &ViperNode,
    header: &SessionHeader,
    servicer_pubkey: &PublicKey,
    payload: &RelayPayload,
    height: u64,
) -> vipernet_core::Result<Relay> {
    let keypair = fisherman.keypair();
    let mut token = Aat {
        version: AAT_VERSION.to_string(),
        requestor_pubkey: header.requestor_pubkey,
        client_pubkey: keypair.public_key(),
        requestor_signature: Signature([0; 64]),
    };
    token.requestor_signature = keypair.sign(&token.hash().0);

    let meta = RelayMeta {
        block_height: height,
    };
    let mut proof = RelayProof {
        entropy: rand::thread_rng().gen(),
        request_hash: compute_request_hash(payload, &meta)?,
        session_block_height: header.session_block_height,
        servicer_pubkey: *servicer_pubkey,
        chain: header.chain.clone(),
        geo_zone: header.geo_zone.clone(),
        num_servicers: header.num_servicers,
        token,
        signature: Signature([0; 64]),
    };
    proof.signature = keypair.sign(&proof.hash()?.0);
    Ok(Relay {
        payload: payload.clone(),
        meta,
        proof,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use vipernet_net::KeyPair;

    #[test]
    fn test_timing_ranges() {
        let timing = SamplerTiming::default();
        for _ in 0..20 {
            let d = timing.start_delay();
            assert!(d >= Duration::from_secs(5) && d <= Duration::from_secs(8));
            let i = timing.interval();
            assert!(i >= Duration::from_secs(15) && i <= Duration::from_secs(35));
        }
        let fixed = SamplerTiming {
            start_delay: (Duration::from_millis(3), Duration::from_millis(3)),
            interval: (Duration::from_millis(9), Duration::from_millis(1)),
        };
        assert_eq!(fixed.start_delay(), Duration::from_millis(3));
        assert_eq!(fixed.interval(), Duration::from_millis(9));
    }

    #[test]
    fn test_probe_relay_is_self_signed() {
        let storage = Storage::temporary().unwrap();
        let fisherman = ViperNode::open(&storage, KeyPair::from_seed(&[7; 32])).unwrap();
        let header = SessionHeader {
            requestor_pubkey: PublicKey([1; 32]),
            chain: ChainId::new("0001").unwrap(),
            geo_zone: GeoZoneId::new("0001").unwrap(),
            num_servicers: 5,
            session_block_height: 5,
        };
        let payload = RelayPayload {
            data: "foo".into(),
            ..Default::default()
        };
        let relay =
            build_probe_relay(&fisherman, &header, &PublicKey([3; 32]), &payload, 6).unwrap();

        assert_eq!(relay.proof.session_header(), header);
        assert_eq!(relay.proof.request_hash, relay.request_hash().unwrap());
        relay.proof.verify_client_signature().unwrap();
        // not signed by the requestor
        assert!(relay.proof.token.verify().is_err());
        crypto::verify_signature(
            &fisherman.public_key(),
            &relay.proof.token.hash().0,
            &relay.proof.token.requestor_signature,
        )
        .unwrap();
    }
}
