use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use hermes::config::StorageConfig;
use hermes::core::{Payload, Sample, Schema, Session, StreamSpec};
use hermes::observability::StreamCounters;
use hermes::storage::{SessionContainer, StorageEngine, StorageEvent};

fn storage_config(root: &std::path::Path, ring_capacity: usize, flush_hz: f64) -> StorageConfig {
    StorageConfig {
        root_dir: root.to_path_buf(),
        flush_hz,
        high_water: 0.75,
        ring_capacity,
        drain_deadline_ms: 2000,
        video_codec: "mjpeg".into(),
    }
}

fn tabular_spec(stream_id: &str) -> StreamSpec {
    StreamSpec {
        stream_id: stream_id.into(),
        device_id: "dev".into(),
        node_id: "node".into(),
        schema: Schema::tabular(vec![2]),
        nominal_rate_hz: 100.0,
        is_burst: false,
        is_video: false,
        channel_names: vec!["a".into(), "b".into()],
    }
}

fn video_spec(stream_id: &str) -> StreamSpec {
    StreamSpec {
        stream_id: stream_id.into(),
        device_id: "cam".into(),
        node_id: "node".into(),
        schema: Schema::opaque(),
        nominal_rate_hz: 20.0,
        is_burst: false,
        is_video: true,
        channel_names: vec![],
    }
}

fn session(id: &str, specs: Vec<StreamSpec>) -> Session {
    Session {
        session_id: id.into(),
        started_at_reference_ns: 1_000,
        participating_brokers: vec!["a".into()],
        streams: specs,
    }
}

fn sample(stream_id: &str, seq: u64, payload: Payload) -> Sample {
    Sample {
        stream_id: stream_id.into(),
        seq,
        reference_ts_ns: 1_000 + seq as i64,
        device_ts_ns: None,
        payload,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn incremental_flush_lands_samples_in_the_container() {
    let root = tempfile::tempdir().unwrap();
    let mut engine = StorageEngine::new(storage_config(root.path(), 256, 20.0), "host", "a");
    let spec = tabular_spec("acc");
    let counters = Arc::new(StreamCounters::new("acc"));
    let mut sink = engine.register_stream(spec.clone(), Arc::clone(&counters));
    let _events = engine.take_events();

    let handle = engine
        .start(session("s1", vec![spec.clone()]), BTreeMap::new(), "digest".into())
        .unwrap();

    for seq in 0..100 {
        assert!(sink.commit(sample("acc", seq, Payload::Tabular(vec![seq as f64, 0.5]))));
    }
    // Incremental, not end-of-session: samples appear before any drain.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(counters.flushed() >= 50, "flushed {} of 100", counters.flushed());

    let report = handle.drain(Duration::from_secs(2)).await;
    assert_eq!(report.unflushed, 0);
    assert!(!report.deadline_hit);
    let mut handle = handle;
    handle.join().unwrap();

    let container =
        SessionContainer::open(&root.path().join("s1").join("a.sqlite")).unwrap();
    assert_eq!(container.sample_count(&spec).unwrap(), 100);
    assert_eq!(counters.flushed(), 100);
    let meta = container.read_metadata().unwrap();
    assert_eq!(meta["config_digest"], "digest");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overflow_is_reported_once_and_never_blocks_the_writer() {
    let root = tempfile::tempdir().unwrap();
    // Flush far too slowly for the offered load.
    let mut engine = StorageEngine::new(storage_config(root.path(), 16, 0.1), "host", "a");
    let spec = tabular_spec("fast");
    let counters = Arc::new(StreamCounters::new("fast"));
    let mut sink = engine.register_stream(spec.clone(), Arc::clone(&counters));
    let mut events = engine.take_events();
    let handle = engine
        .start(session("s2", vec![spec.clone()]), BTreeMap::new(), "digest".into())
        .unwrap();

    // Exactly at capacity still succeeds; one beyond is the overflow.
    for seq in 0..16 {
        assert!(sink.commit(sample("fast", seq, Payload::Tabular(vec![0.0, 0.0]))));
    }
    assert!(!sink.commit(sample("fast", 16, Payload::Tabular(vec![0.0, 0.0]))));
    assert!(!sink.commit(sample("fast", 17, Payload::Tabular(vec![0.0, 0.0]))));

    match events.recv().await {
        Some(StorageEvent::Overflow { stream_id }) => assert_eq!(stream_id, "fast"),
        other => panic!("expected overflow event, got {:?}", other),
    }
    // Reported once, counted per drop.
    assert!(events.try_recv().is_err());
    assert_eq!(counters.dropped(), 2);

    // Partial data survives the drain.
    let report = handle.drain(Duration::from_secs(2)).await;
    assert_eq!(report.unflushed, 0);
    let mut handle = handle;
    handle.join().unwrap();
    let container = SessionContainer::open(&root.path().join("s2").join("a.sqlite")).unwrap();
    assert_eq!(container.sample_count(&spec).unwrap(), 16);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drain_deadline_discards_and_reports_the_remainder() {
    let root = tempfile::tempdir().unwrap();
    let mut engine = StorageEngine::new(storage_config(root.path(), 200_000, 0.05), "host", "a");
    let spec = tabular_spec("bulk");
    let counters = Arc::new(StreamCounters::new("bulk"));
    let mut sink = engine.register_stream(spec.clone(), Arc::clone(&counters));
    let _events = engine.take_events();
    let handle = engine
        .start(session("s3", vec![spec.clone()]), BTreeMap::new(), "digest".into())
        .unwrap();

    for seq in 0..150_000u64 {
        assert!(sink.commit(sample("bulk", seq, Payload::Tabular(vec![0.0, 0.0]))));
    }

    // A deadline this tight cannot flush 150k rows.
    let report = handle.drain(Duration::from_millis(1)).await;
    assert!(report.deadline_hit);
    assert!(report.unflushed > 0, "expected a reported remainder");

    let mut handle = handle;
    let err = handle.join().unwrap_err();
    assert_eq!(err.exit_code(), 0, "drain timeout is soft");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn video_stream_writes_sidecar_and_index() {
    let root = tempfile::tempdir().unwrap();
    let mut engine = StorageEngine::new(storage_config(root.path(), 64, 20.0), "host", "b");
    let spec = video_spec("cam-0");
    let counters = Arc::new(StreamCounters::new("cam-0"));
    let mut sink = engine.register_stream(spec.clone(), Arc::clone(&counters));
    let _events = engine.take_events();
    let handle = engine
        .start(session("s4", vec![spec.clone()]), BTreeMap::new(), "digest".into())
        .unwrap();

    for seq in 0..10 {
        let frame = vec![seq as u8; 100];
        assert!(sink.commit(sample("cam-0", seq, Payload::Frame(frame))));
    }
    let report = handle.drain(Duration::from_secs(2)).await;
    assert_eq!(report.unflushed, 0);
    let mut handle = handle;
    handle.join().unwrap();

    let session_dir = root.path().join("s4");
    let container = SessionContainer::open(&session_dir.join("b.sqlite")).unwrap();
    assert_eq!(container.sample_count(&spec).unwrap(), 10);
    let sidecar = std::fs::metadata(session_dir.join("cam-0.mjpeg")).unwrap();
    assert_eq!(sidecar.len(), 10 * 100);
}
