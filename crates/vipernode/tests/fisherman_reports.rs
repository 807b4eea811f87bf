//! Fisherman sampling, availability penalties and QoS reports

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use vipernet_core::*;
use vipernet_core::msgs::QOS_REPORT_FEE;
use vipernet_net::{HostedChain, UpstreamClient};
use vipernode::devnet::{ChainEvent, DevnetChain, GenesisBalance};
use vipernode::interfaces::ChainTx;
use vipernode::fisherman::{AvailabilityMonitor, SamplePool, Sampler, SamplerTiming};
use vipernode::metrics::Metrics;
use vipernode::{ChainHandles, ErrorCode, RuntimeSettings, Storage, ViperNode};

fn sample_payloads() -> Vec<RelayPayload> {
    vec![RelayPayload {
        data: r#"{"jsonrpc":"2.0","method":"eth_blockNumber","id":1}"#.into(),
        ..Default::default()
    }]
}

#[tokio::test]
async fn test_unavailable_servicer_penalized_once() {
    let upstream = spawn_upstream().await;
    let devnet = Arc::new(DevnetChain::new(genesis()).unwrap());
    let storage = Storage::temporary().unwrap();
    let fisherman = Arc::new(ViperNode::open(&storage, validator_key(1)).unwrap());
    // genesis service urls point at a closed port
    let target = validator_key(3).address();
    let header = SessionHeader {
        requestor_pubkey: PublicKey([42; 32]),
        chain: chain_id(),
        geo_zone: geo_zone(),
        num_servicers: 1,
        session_block_height: 1,
    };
    let (_height_tx, heights) = watch::channel(1);
    let sampler = Sampler {
        chain: ChainHandles::from_single(devnet.clone()),
        upstream: UpstreamClient::new(Duration::from_millis(500)).unwrap(),
        local_chain: HostedChain {
            id: chain_id(),
            url: upstream,
            websocket_url: None,
            basic_auth: None,
        },
        payloads: sample_payloads(),
        node: fisherman.clone(),
        session: Arc::new(Session {
            header: header.clone(),
            session_key: Hash32([0; 32]),
            servicers: vec![target],
            fishermen: vec![fisherman.address()],
        }),
        session_end: 4,
        timing: SamplerTiming::default(),
        metrics: Metrics::new().unwrap(),
        heights,
    };

    let mut monitor = AvailabilityMonitor::new();
    let mut penalties = Vec::new();
    for _ in 0..6 {
        let (samples, penalized) = sampler.sample_round(&mut monitor).await;
        assert_eq!(samples, 1);
        penalties.push(penalized);
    }
    assert_eq!(penalties, vec![0, 0, 0, 0, 1, 0]);

    let events = devnet.events();
    let paused = events
        .iter()
        .filter(|e| matches!(e, ChainEvent::Paused { address } if *address == target))
        .count();
    let burned = events
        .iter()
        .filter(|e| matches!(e, ChainEvent::BurnedNoActivity { address, .. } if *address == target))
        .count();
    assert_eq!((paused, burned), (1, 1));
    assert!(devnet.validator(&target).unwrap().paused);

    let key = crypto::evidence_key(&header, EvidenceType::FishermanTestEvidence, &target).unwrap();
    let results = fisherman.results.get(&key).unwrap();
    assert_eq!(results.num_test_results, 6);
    assert!(results.test_results.iter().all(|r| !r.is_available && !r.is_reliable));
}

#[tokio::test]
async fn test_trigger_starts_one_sampler() {
    let settings = RuntimeSettings {
        sampler_timing: SamplerTiming {
            start_delay: (Duration::from_secs(60), Duration::from_secs(60)),
            interval: (Duration::from_secs(60), Duration::from_secs(60)),
        },
        ..RuntimeSettings::default()
    };
    let pool = SamplePool::new([(chain_id(), sample_payloads())]).unwrap();
    let h = Harness::build(settings, None, pool).await;
    let servicer = h.servicer(1).await;
    let proof = signed_relay(&servicer.public_key(), 1, 1, 1).proof;

    let ack = h.runtime.trigger_fisherman(proof.clone()).await.unwrap();
    assert!(ack.started);
    assert_eq!(ack.session_block_height, 1);
    let session = h.runtime.dispatch(h.header(1)).await.unwrap();
    assert!(session.has_fisherman(&ack.fisherman));

    let again = h.runtime.trigger_fisherman(proof.clone()).await.unwrap();
    assert!(!again.started);
    assert_eq!(again.fisherman, ack.fisherman);
    assert_eq!(h.runtime.active_samplers(), 1);

    // session 1..=4 is over at height 5
    h.devnet.advance_to(5);
    let err = h.runtime.trigger_fisherman(proof).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidSession);
}

#[tokio::test]
async fn test_qos_report_feeds_report_card() {
    let h = Harness::new().await;
    let session = h.runtime.dispatch(h.header(1)).await.unwrap();
    let servicer = session.servicers[0];
    let fisherman = session.fishermen[0];
    let servicer_key = (1..=VALIDATORS)
        .map(validator_key)
        .find(|k| k.address() == servicer)
        .unwrap();

    for entropy in 0..10 {
        h.runtime
            .handle_relay(signed_relay(&servicer_key.public_key(), entropy, 1, 1))
            .await
            .unwrap();
    }
    let fisher_node = h.runtime.node(&fisherman).unwrap();
    for i in 0..30 {
        fisher_node
            .results
            .add_result(
                &h.header(1),
                TestResult {
                    servicer_address: servicer,
                    timestamp_ms: 1_700_000_000_000 + i,
                    latency: Duration::from_millis(20),
                    is_available: true,
                    is_reliable: true,
                },
            )
            .unwrap();
    }

    h.devnet.advance_to(5);
    h.runtime.on_new_block(5).await;
    let events = h.devnet.events();
    assert!(events.contains(&ChainEvent::QosReportAccepted {
        fisherman,
        servicer,
        session: 1
    }));
    assert!(fisher_node.results.keys().is_empty());

    h.devnet.advance_to(13);
    h.runtime.on_new_block(13).await;
    let events = h.devnet.events();
    assert!(events.contains(&ChainEvent::ReportCardUpdated {
        address: servicer,
        session: 1
    }));
    assert!(events.contains(&ChainEvent::ProofAccepted {
        from: servicer,
        session: 1,
        reward: 10_000
    }));
    let card = h.devnet.validator(&servicer).unwrap().report_card;
    assert_eq!(card.total_sessions, 1);
    assert_eq!(card.average(), Some(QosScores::uniform(Dec::one())));
}

fn samples(servicer: Address, latency_ms: u64) -> Vec<TestResult> {
    (0..30)
        .map(|i| TestResult {
            servicer_address: servicer,
            timestamp_ms: 1_700_000_000_000 + i,
            latency: Duration::from_millis(latency_ms),
            is_available: true,
            is_reliable: true,
        })
        .collect()
}

#[tokio::test]
async fn test_late_report_scored_against_whole_session() {
    // balances do not affect session derivation
    let reference = Harness::new().await;
    let header = reference.header(1);
    let session = reference.runtime.dispatch(header.clone()).await.unwrap();
    let fisherman = session.fishermen[0];
    let key_of = |s: &Address| {
        crypto::evidence_key(&header, EvidenceType::FishermanTestEvidence, s).unwrap()
    };
    // reports go out in key order, so the fast servicer is processed first
    let mut servicers: Vec<Address> = session.servicers[..2].to_vec();
    servicers.sort_by_key(|s| key_of(s));
    let (fast, slow) = (servicers[0], servicers[1]);

    let mut g = genesis();
    g.balances.push(GenesisBalance {
        address: fisherman,
        amount: QOS_REPORT_FEE,
    });
    let h = Harness::with_genesis(g, RuntimeSettings::default(), None, SamplePool::default()).await;
    assert_eq!(h.runtime.dispatch(h.header(1)).await.unwrap(), session);

    let node = h.runtime.node(&fisherman).unwrap();
    for (servicer, ms) in [(fast, 20), (slow, 40)] {
        for result in samples(servicer, ms) {
            node.results.add_result(&h.header(1), result).unwrap();
        }
    }

    // funds cover one report
    h.devnet.advance_to(5);
    h.runtime.on_new_block(5).await;
    let accepted = |servicer: Address| ChainEvent::QosReportAccepted {
        fisherman,
        servicer,
        session: 1,
    };
    let events = h.devnet.events();
    assert!(events.contains(&accepted(fast)));
    assert!(!events.contains(&accepted(slow)));
    let pending = node.results.get(&key_of(&slow)).unwrap();
    assert!(pending.sealed);
    assert_eq!(pending.session_fastest, Some(Duration::from_millis(20)));

    h.devnet.mint(&fisherman, QOS_REPORT_FEE);
    h.devnet.advance_to(6);
    h.runtime.on_new_block(6).await;
    assert!(h.devnet.events().contains(&accepted(slow)));
    assert!(node.results.keys().is_empty());

    let fast_report = h.devnet.get_qos_report(&h.header(1), &fast).await.unwrap().unwrap();
    let slow_report = h.devnet.get_qos_report(&h.header(1), &slow).await.unwrap().unwrap();
    assert_eq!(fast_report.report.latency_score, Dec::one());
    assert_eq!(slow_report.report.latency_score, Dec::from_ratio(1, 2).unwrap());
}
