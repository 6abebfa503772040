use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use hermes::config::NodeRole;
use hermes::core::{Payload, ReferenceClock, Session};
use hermes::delay::{ConstantDelay, DelayEstimator, ZeroDelay};
use hermes::drivers::{DriverContext, DriverRegistry};
use hermes::keyboard::KeyboardHub;
use hermes::node::{
    coordination_channel, ManagedNode, NodeCommand, NodeReply, NodeState, NodeStatus,
    ProducerWorker, RoleWorker,
};
use hermes::observability::StreamCounters;
use hermes::storage::StorageEngine;
use hermes::transport::LocalBus;
use hermes::{Schema, StreamSpec};

struct ScriptedWorker {
    fail_init: bool,
}

#[async_trait]
impl RoleWorker for ScriptedWorker {
    fn node_id(&self) -> &str {
        "scripted"
    }

    async fn init(&mut self) -> Result<()> {
        if self.fail_init {
            bail!("device refused to open");
        }
        Ok(())
    }

    async fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    async fn start(&mut self, _session: Arc<Session>) -> Result<()> {
        Ok(())
    }

    async fn drain(&mut self) -> Result<()> {
        Ok(())
    }

    async fn abort(&mut self) {}
}

fn test_session() -> Arc<Session> {
    Arc::new(Session {
        session_id: "s".into(),
        started_at_reference_ns: 0,
        participating_brokers: vec!["a".into()],
        streams: vec![],
    })
}

#[tokio::test]
async fn lifecycle_follows_the_coordination_protocol() {
    let (status_tx, mut status_rx) = mpsc::channel(16);
    let (mut handle, endpoint) = coordination_channel("scripted", NodeRole::Producer, status_tx);
    handle.attach(tokio::spawn(
        ManagedNode::new(Box::new(ScriptedWorker { fail_init: false })).run(endpoint),
    ));

    // START before PREPARE is an undefined transition, surfaced loudly.
    let reply = handle.request(NodeCommand::Start(test_session())).await.unwrap();
    assert!(matches!(reply, NodeReply::Rejected(_)));

    let reply = handle.request(NodeCommand::Prepare).await.unwrap();
    assert_eq!(reply, NodeReply::Accepted(NodeState::Ready));
    let reply = handle.request(NodeCommand::Start(test_session())).await.unwrap();
    assert_eq!(reply, NodeReply::Accepted(NodeState::Running));
    let reply = handle.request(NodeCommand::Stop).await.unwrap();
    assert_eq!(reply, NodeReply::Accepted(NodeState::Draining));

    // Status stream: ready, running, draining, done.
    let mut states = Vec::new();
    while let Some(status) = status_rx.recv().await {
        if let NodeStatus::StateChanged { state, .. } = status {
            states.push(state);
            if state.is_terminal() {
                break;
            }
        }
    }
    assert_eq!(
        states,
        vec![
            NodeState::Ready,
            NodeState::Running,
            NodeState::Draining,
            NodeState::Done
        ]
    );
    handle.join().await;
}

#[tokio::test]
async fn failed_device_acquisition_reports_a_fatal_fault() {
    let (status_tx, mut status_rx) = mpsc::channel(16);
    let (_handle, endpoint) = coordination_channel("scripted", NodeRole::Producer, status_tx);
    tokio::spawn(ManagedNode::new(Box::new(ScriptedWorker { fail_init: true })).run(endpoint));

    match status_rx.recv().await.unwrap() {
        NodeStatus::Fault { node_id, fatal, .. } => {
            assert_eq!(node_id, "scripted");
            assert!(fatal);
        }
        other => panic!("expected fault, got {:?}", other),
    }
    match status_rx.recv().await.unwrap() {
        NodeStatus::StateChanged { state, .. } => assert_eq!(state, NodeState::Error),
        other => panic!("expected error state, got {:?}", other),
    }
}

/// Full producer path without a broker: samples come out stamped on the
/// reference clock with per-stream monotonic sequence numbers.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn producer_publishes_monotonic_stamped_samples() {
    let spec = StreamSpec {
        stream_id: "imu-acc".into(),
        device_id: "sim-imu".into(),
        node_id: "imu".into(),
        schema: Schema::tabular(vec![3]),
        nominal_rate_hz: 200.0,
        is_burst: false,
        is_video: false,
        channel_names: vec!["x".into(), "y".into(), "z".into()],
    };
    let clock = ReferenceClock::new();
    clock.anchor_to_epoch();
    let bus = LocalBus::new(256);
    let mut subscription = bus.subscribe(vec!["imu".into()]);

    let root = tempfile::tempdir().unwrap();
    let mut engine = StorageEngine::new(
        hermes::config::StorageConfig {
            root_dir: root.path().to_path_buf(),
            ..Default::default()
        },
        "host",
        "a",
    );
    let counters = Arc::new(StreamCounters::new("imu-acc"));
    let sink = engine.register_stream(spec.clone(), Arc::clone(&counters));

    let registry = DriverRegistry::with_builtins();
    let ctx = DriverContext {
        keyboard: Arc::new(KeyboardHub::new(8)),
    };
    let source = registry
        .create_source("sim-imu", &[spec.clone()], &serde_json::json!({}), &ctx)
        .unwrap();

    let (status_tx, _status_rx) = mpsc::channel(16);
    let delays: HashMap<String, Arc<dyn DelayEstimator>> =
        HashMap::from([("imu-acc".to_string(), Arc::new(ZeroDelay) as Arc<dyn DelayEstimator>)]);
    let mut worker = ProducerWorker::new(
        "imu",
        "a",
        source,
        vec![spec.clone()],
        HashMap::from([("imu-acc".to_string(), sink)]),
        HashMap::from([("imu-acc".to_string(), Arc::clone(&counters))]),
        bus.clone(),
        Arc::clone(&clock),
        delays,
        status_tx,
        None,
    );

    worker.init().await.unwrap();
    worker.prepare().await.unwrap();
    let started_at = clock.reference_time_ns();
    let session = Arc::new(Session {
        session_id: "s".into(),
        started_at_reference_ns: started_at,
        participating_brokers: vec!["a".into()],
        streams: vec![spec.clone()],
    });
    worker.start(session).await.unwrap();

    let mut seen = Vec::new();
    while seen.len() < 20 {
        let msg = subscription.recv().await.expect("bus open");
        assert_eq!(msg.topic, "imu.imu-acc");
        assert_eq!(msg.publisher_id, "a/imu");
        assert!(matches!(msg.payload, Payload::Tabular(ref v) if v.len() == 3));
        seen.push((msg.seq, msg.reference_ts_ns));
    }
    worker.drain().await.unwrap();

    for (i, (seq, ts)) in seen.iter().enumerate() {
        assert_eq!(*seq, i as u64);
        assert!(*ts >= started_at);
        if i > 0 {
            assert!(*ts >= seen[i - 1].1, "reference_ts regressed at {}", i);
        }
    }
    assert!(counters.published() >= 20);
}

/// The delay correction shifts the stamp back to the sensed moment.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delay_estimate_is_subtracted_at_ingress() {
    const DELAY_NS: i64 = 1_000_000_000;

    let spec = StreamSpec {
        stream_id: "emg".into(),
        device_id: "sim-imu".into(),
        node_id: "emg".into(),
        schema: Schema::tabular(vec![1]),
        nominal_rate_hz: 200.0,
        is_burst: false,
        is_video: false,
        channel_names: vec!["ch0".into()],
    };
    let clock = ReferenceClock::new();
    clock.anchor_to_epoch();
    let bus = LocalBus::new(64);
    let mut subscription = bus.subscribe(vec!["emg".into()]);

    let registry = DriverRegistry::with_builtins();
    let ctx = DriverContext {
        keyboard: Arc::new(KeyboardHub::new(8)),
    };
    let source = registry
        .create_source("sim-imu", &[spec.clone()], &serde_json::json!({}), &ctx)
        .unwrap();

    let (status_tx, _status_rx) = mpsc::channel(16);
    let delays: HashMap<String, Arc<dyn DelayEstimator>> = HashMap::from([(
        "emg".to_string(),
        Arc::new(ConstantDelay::new(DELAY_NS)) as Arc<dyn DelayEstimator>,
    )]);
    let mut worker = ProducerWorker::new(
        "emg",
        "a",
        source,
        vec![spec.clone()],
        HashMap::new(),
        HashMap::new(),
        bus.clone(),
        Arc::clone(&clock),
        delays,
        status_tx,
        None,
    );
    worker.init().await.unwrap();
    worker.prepare().await.unwrap();
    worker.start(test_session()).await.unwrap();

    let msg = subscription.recv().await.unwrap();
    let now = clock.reference_time_ns();
    assert!(
        msg.reference_ts_ns <= now - DELAY_NS + 100_000_000,
        "stamp {} not shifted back by the configured delay (now {})",
        msg.reference_ts_ns,
        now
    );
    worker.drain().await.unwrap();
}
