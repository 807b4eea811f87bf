//! Prometheus counters for relay service activity
//!
//! The registry is owned by the runtime; nothing is registered globally.

use prometheus::core::Collector;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
};

/// A struct definition for collecting metrics in the node
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Relays served, by chain and outcome (`ok` / `error`)
    pub relays: IntCounterVec,
    /// Relay failures by chain and error code
    pub relay_errors: IntCounterVec,
    /// Upstream round trip of served relays
    pub upstream_latency: HistogramVec,
    /// Proofs appended to evidence, by evidence type
    pub proofs_stored: IntCounterVec,
    /// Evidence sealed for claiming
    pub evidence_sealed: IntCounter,
    /// Claim and proof submissions by stage and outcome
    pub claims: IntCounterVec,
    /// QoS report submissions by outcome
    pub qos_reports: IntCounterVec,
    /// Fisherman samples by availability
    pub samples: IntCounterVec,
    /// Probe latency seen by fishermen
    pub sample_latency: Histogram,
    /// No-activity penalties issued by fishermen
    pub penalties: IntCounter,
}

impl Metrics {
    /// Instantiate every metric and register it with a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let relays = IntCounterVec::new(
            Opts::new("vipernode_relays_total", "Relays handled"),
            &["chain", "outcome"],
        )?;
        let relay_errors = IntCounterVec::new(
            Opts::new("vipernode_relay_errors_total", "Relay failures by error code"),
            &["chain", "code"],
        )?;
        let upstream_latency = HistogramVec::new(
            HistogramOpts::new(
                "vipernode_upstream_latency_seconds",
                "Upstream round trip of served relays",
            ),
            &["chain"],
        )?;
        let proofs_stored = IntCounterVec::new(
            Opts::new("vipernode_proofs_stored_total", "Proofs appended to evidence"),
            &["evidence_type"],
        )?;
        let evidence_sealed = IntCounter::new(
            "vipernode_evidence_sealed_total",
            "Evidence sealed for claiming",
        )?;
        let claims = IntCounterVec::new(
            Opts::new("vipernode_claims_total", "Claim and proof submissions"),
            &["stage", "outcome"],
        )?;
        let qos_reports = IntCounterVec::new(
            Opts::new("vipernode_qos_reports_total", "QoS report submissions"),
            &["outcome"],
        )?;
        let samples = IntCounterVec::new(
            Opts::new("vipernode_fisherman_samples_total", "Fisherman samples"),
            &["available"],
        )?;
        let sample_latency = Histogram::with_opts(HistogramOpts::new(
            "vipernode_fisherman_sample_latency_seconds",
            "Probe latency seen by fishermen",
        ))?;
        let penalties = IntCounter::new(
            "vipernode_penalties_total",
            "No-activity penalties issued",
        )?;

        registry.register(Box::new(relays.clone()))?;
        registry.register(Box::new(relay_errors.clone()))?;
        registry.register(Box::new(upstream_latency.clone()))?;
        registry.register(Box::new(proofs_stored.clone()))?;
        registry.register(Box::new(evidence_sealed.clone()))?;
        registry.register(Box::new(claims.clone()))?;
        registry.register(Box::new(qos_reports.clone()))?;
        registry.register(Box::new(samples.clone()))?;
        registry.register(Box::new(sample_latency.clone()))?;
        registry.register(Box::new(penalties.clone()))?;

        Ok(Self {
            registry,
            relays,
            relay_errors,
            upstream_latency,
            proofs_stored,
            evidence_sealed,
            claims,
            qos_reports,
            samples,
            sample_latency,
            penalties,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Totals for the periodic stats line
    pub fn snapshot(&self) -> MetricsSnapshot {
        let sum = |vec: &IntCounterVec| -> u64 {
            vec.collect()
                .iter()
                .flat_map(|family| family.get_metric())
                .map(|m| m.get_counter().get_value() as u64)
                .sum()
        };
        MetricsSnapshot {
            relays: sum(&self.relays),
            relay_errors: sum(&self.relay_errors),
            proofs_stored: sum(&self.proofs_stored),
            evidence_sealed: self.evidence_sealed.get(),
            claims: sum(&self.claims),
            qos_reports: sum(&self.qos_reports),
            samples: sum(&self.samples),
            penalties: self.penalties.get(),
        }
    }
}

/// Counter totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub relays: u64,
    pub relay_errors: u64,
    pub proofs_stored: u64,
    pub evidence_sealed: u64,
    pub claims: u64,
    pub qos_reports: u64,
    pub samples: u64,
    pub penalties: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registries_are_independent() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.relays.with_label_values(&["0001", "ok"]).inc();
        a.relays.with_label_values(&["0001", "error"]).inc_by(2);
        a.penalties.inc();
        assert_eq!(a.snapshot().relays, 3);
        assert_eq!(a.snapshot().penalties, 1);
        assert_eq!(b.snapshot(), MetricsSnapshot::default());
    }
}
