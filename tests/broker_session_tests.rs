use std::path::Path;
use std::time::Duration;

use hermes::storage::SessionContainer;
use hermes::{HermesConfig, Host};

fn single_host_config(ctrl_port: u16, data_port: u16, root: &Path, duration_s: Option<f64>) -> HermesConfig {
    serde_json::from_value(serde_json::json!({
        "broker_id": "a",
        "control_addr": format!("127.0.0.1:{}", ctrl_port),
        "data_addr": format!("127.0.0.1:{}", data_port),
        "clock_eligible": true,
        "duration_s": duration_s,
        "nodes": [
            {
                "node_id": "imu",
                "role": "producer",
                "driver": "sim-imu",
                "streams": [{
                    "stream_id": "imu-acc",
                    "rate_hz": 100.0,
                    "shape": [3],
                    "channel_names": ["x", "y", "z"]
                }]
            },
            {
                "node_id": "logger",
                "role": "consumer",
                "topics": ["imu"]
            }
        ],
        "storage": {
            "root_dir": root,
            "flush_hz": 5.0,
            "drain_deadline_ms": 3000
        },
        "sync": {"discover_timeout_ms": 1000, "sync_timeout_ms": 1000},
        "experiment": {"project": "selftest", "subject": "001"}
    }))
    .unwrap()
}

fn imu_spec() -> hermes::StreamSpec {
    hermes::StreamSpec {
        stream_id: "imu-acc".into(),
        device_id: "sim-imu".into(),
        node_id: "imu".into(),
        schema: hermes::Schema::tabular(vec![3]),
        nominal_rate_hz: 100.0,
        is_burst: false,
        is_video: false,
        channel_names: vec!["x".into(), "y".into(), "z".into()],
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duration_bounded_session_persists_aligned_samples() {
    let root = tempfile::tempdir().unwrap();
    let config = single_host_config(47111, 47112, root.path(), Some(1.2));
    let host = Host::new(config).unwrap();

    let outcome = host.run(false).await;
    assert!(outcome.error.is_none(), "unexpected error: {:?}", outcome.error);
    assert_eq!(outcome.summary.drain_reason, "duration elapsed");
    let session_id = outcome.summary.session_id.clone().expect("session stamped");

    let container_path = root.path().join(&session_id).join("a.sqlite");
    let container = SessionContainer::open(&container_path).unwrap();

    // Metadata round-trips bit-exact.
    let meta = container.read_metadata().unwrap();
    assert_eq!(meta["session_id"], session_id);
    assert_eq!(meta["broker_id"], "a");
    assert_eq!(meta["experiment.project"], "selftest");
    let started_at: i64 = meta["started_at_reference_ns"].parse().unwrap();

    // Roughly rate * duration rows, with generous jitter margins.
    let rows = container.dataset_rows(&imu_spec()).unwrap();
    assert!(
        rows.len() >= 60 && rows.len() <= 240,
        "unexpected row count {}",
        rows.len()
    );

    // Sequence numbers are gap-free from zero and timestamps never run
    // backwards nor precede the session start.
    let mut prev_ts = started_at;
    for (i, (seq, ts)) in rows.iter().enumerate() {
        assert_eq!(*seq, i as u64);
        assert!(*ts >= started_at, "sample {} stamped before session start", i);
        assert!(*ts >= prev_ts, "timestamp regressed at sample {}", i);
        prev_ts = *ts;
    }

    // Clean stop: everything published was flushed, nothing dropped.
    let counters = outcome
        .summary
        .counters
        .iter()
        .find(|c| c.stream_id == "imu-acc")
        .expect("imu counters");
    assert_eq!(counters.dropped, 0);
    assert_eq!(counters.published, counters.flushed);
    assert_eq!(rows.len() as u64, counters.flushed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn operator_stop_line_drains_the_session() {
    let root = tempfile::tempdir().unwrap();
    let config = single_host_config(47121, 47122, root.path(), None);
    let host = Host::new(config).unwrap();
    let keyboard = host.keyboard();

    let typist = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(600)).await;
        keyboard.post_line("q");
    });

    let outcome = host.run(false).await;
    typist.await.unwrap();

    assert!(outcome.error.is_none(), "unexpected error: {:?}", outcome.error);
    assert_eq!(outcome.summary.drain_reason, "operator stop");
    assert!(outcome.summary.session_id.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn device_open_failure_fails_the_host_by_default() {
    let root = tempfile::tempdir().unwrap();
    let mut config = single_host_config(47131, 47132, root.path(), Some(5.0));
    config.nodes[0].params = serde_json::json!({"fail_open": true});
    let host = Host::new(config).unwrap();

    let outcome = host.run(false).await;
    let err = outcome.error.expect("device failure must fail the host");
    assert_eq!(err.exit_code(), 5);
    assert!(outcome.summary.session_id.is_none(), "session must not start");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn device_open_failure_degrades_when_configured() {
    let root = tempfile::tempdir().unwrap();
    let mut config = single_host_config(47141, 47142, root.path(), Some(0.8));
    config.nodes[0].params = serde_json::json!({"fail_open": true});
    config.on_node_error = hermes::config::NodeErrorPolicy::Degrade;
    let host = Host::new(config).unwrap();

    let outcome = host.run(false).await;
    assert!(outcome.error.is_none(), "degraded run should finish: {:?}", outcome.error);
    assert!(outcome.summary.session_id.is_some());
}
