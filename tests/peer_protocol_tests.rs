use std::path::Path;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};

use hermes::transport::{wire, BrokerDescriptor, ControlKind, ControlMessage};
use hermes::{HermesConfig, Host};

fn host_a(ctrl: u16, data: u16, peer_ctrl: u16, peer_data: u16, root: &Path, timeouts_ms: u64) -> HermesConfig {
    serde_json::from_value(serde_json::json!({
        "broker_id": "a",
        "control_addr": format!("127.0.0.1:{}", ctrl),
        "data_addr": format!("127.0.0.1:{}", data),
        "clock_eligible": true,
        "duration_s": 1.5,
        "peers": [{
            "broker_id": "b",
            "control_addr": format!("127.0.0.1:{}", peer_ctrl),
            "data_addr": format!("127.0.0.1:{}", peer_data)
        }],
        "nodes": [{
            "node_id": "imu",
            "role": "producer",
            "driver": "sim-imu",
            "streams": [{"stream_id": "imu-acc", "rate_hz": 50.0, "shape": [3]}]
        }],
        "storage": {"root_dir": root, "flush_hz": 5.0, "drain_deadline_ms": 2000},
        "sync": {"discover_timeout_ms": timeouts_ms, "sync_timeout_ms": timeouts_ms}
    }))
    .unwrap()
}

fn fake_descriptor(ctrl: u16, data: u16) -> BrokerDescriptor {
    BrokerDescriptor {
        broker_id: "b".into(),
        control_addr: format!("127.0.0.1:{}", ctrl),
        data_addr: format!("127.0.0.1:{}", data),
        clock_eligible: false,
        local_nodes: vec![],
    }
}

fn msg(kind: ControlKind) -> ControlMessage {
    ControlMessage {
        sender_id: "b".into(),
        monotonic_ns: 0,
        kind,
    }
}

async fn read_kind(stream: &mut TcpStream) -> ControlKind {
    wire::read_control(stream).await.unwrap().kind
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_peer_is_a_discovery_error() {
    let root = tempfile::tempdir().unwrap();
    // Nothing listens on the peer ports.
    let config = host_a(47311, 47312, 47313, 47314, root.path(), 500);
    let host = Host::new(config).unwrap();

    let started = Instant::now();
    let outcome = host.run(false).await;
    let err = outcome.error.expect("discovery must fail");
    assert_eq!(err.exit_code(), 3);
    assert!(
        started.elapsed() >= Duration::from_millis(400),
        "must not give up before the discovery deadline"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn announce_without_sync_ok_is_a_sync_error() {
    let root = tempfile::tempdir().unwrap();
    let peer_ctrl = TcpListener::bind("127.0.0.1:47323").await.unwrap();
    let _peer_data = TcpListener::bind("127.0.0.1:47324").await.unwrap();
    let config = host_a(47321, 47322, 47323, 47324, root.path(), 700);

    // The peer announces itself and then goes silent for the entire
    // sync phase.
    let silent_peer = tokio::spawn(async move {
        let mut to_a = TcpStream::connect("127.0.0.1:47321").await.unwrap();
        wire::write_control(
            &mut to_a,
            &msg(ControlKind::Announce {
                descriptor: fake_descriptor(47323, 47324),
            }),
        )
        .await
        .unwrap();
        // Accept A's dial so discovery completes on its side.
        let (_from_a, _) = peer_ctrl.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        drop(to_a);
    });

    let started = Instant::now();
    let outcome = Host::new(config).unwrap().run(false).await;
    silent_peer.abort();

    let err = outcome.error.expect("sync must fail");
    assert_eq!(err.exit_code(), 3);
    assert!(
        started.elapsed() >= Duration::from_millis(600),
        "sync barrier must wait out the full timeout"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn conflicting_reference_claim_fails_the_session() {
    let root = tempfile::tempdir().unwrap();
    let peer_ctrl = TcpListener::bind("127.0.0.1:47333").await.unwrap();
    let _peer_data = TcpListener::bind("127.0.0.1:47334").await.unwrap();
    let config = host_a(47331, 47332, 47333, 47334, root.path(), 2000);

    // The peer acknowledges sync but claims a different reference, as a
    // split clock-eligibility configuration would.
    let split_peer = tokio::spawn(async move {
        let mut to_a = TcpStream::connect("127.0.0.1:47331").await.unwrap();
        wire::write_control(
            &mut to_a,
            &msg(ControlKind::Announce {
                descriptor: fake_descriptor(47333, 47334),
            }),
        )
        .await
        .unwrap();
        let (_from_a, _) = peer_ctrl.accept().await.unwrap();
        wire::write_control(&mut to_a, &msg(ControlKind::SyncOk { elected: "b".into() }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        drop(to_a);
    });

    let outcome = Host::new(config).unwrap().run(false).await;
    split_peer.abort();

    let err = outcome.error.expect("split reference must fail");
    assert_eq!(err.exit_code(), 3);
    assert!(err.to_string().contains("split reference"), "got: {}", err);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn peer_disappearance_during_run_degrades_gracefully() {
    let root = tempfile::tempdir().unwrap();
    let peer_ctrl = TcpListener::bind("127.0.0.1:47343").await.unwrap();
    let peer_data = TcpListener::bind("127.0.0.1:47344").await.unwrap();
    let config = host_a(47341, 47342, 47343, 47344, root.path(), 4000);

    // A peer that walks the whole handshake and then dies mid-run.
    let doomed_peer = tokio::spawn(async move {
        let mut to_a = TcpStream::connect("127.0.0.1:47341").await.unwrap();
        wire::write_control(
            &mut to_a,
            &msg(ControlKind::Announce {
                descriptor: fake_descriptor(47343, 47344),
            }),
        )
        .await
        .unwrap();
        let (mut from_a, _) = peer_ctrl.accept().await.unwrap();
        // A announces on its own dial connection.
        assert!(matches!(read_kind(&mut from_a).await, ControlKind::Announce { .. }));

        // Probe the reference and wait for the reply plus A's SYNC_OK.
        wire::write_control(&mut to_a, &msg(ControlKind::SyncProbe { t0_ns: 0 })).await.unwrap();
        let mut saw_reply = false;
        let mut saw_sync_ok = false;
        while !(saw_reply && saw_sync_ok) {
            match read_kind(&mut from_a).await {
                ControlKind::SyncReply { .. } => saw_reply = true,
                ControlKind::SyncOk { elected } => {
                    assert_eq!(elected, "a");
                    saw_sync_ok = true;
                }
                other => panic!("unexpected control message {:?}", other),
            }
        }
        wire::write_control(&mut to_a, &msg(ControlKind::SyncOk { elected: "a".into() }))
            .await
            .unwrap();

        // Hold A's data link open, trade READY, wait for START.
        let (_data_conn, _) = peer_data.accept().await.unwrap();
        wire::write_control(&mut to_a, &msg(ControlKind::Ready)).await.unwrap();
        loop {
            match read_kind(&mut from_a).await {
                ControlKind::Start { .. } => break,
                ControlKind::Ready => {}
                other => panic!("unexpected control message {:?}", other),
            }
        }

        // Mid-run, die without ceremony.
        tokio::time::sleep(Duration::from_millis(400)).await;
    });

    let outcome = Host::new(config).unwrap().run(false).await;
    doomed_peer.await.unwrap();

    // A keeps serving local subscribers and finishes its own session.
    assert!(outcome.error.is_none(), "expected clean stop: {:?}", outcome.error);
    assert_eq!(outcome.summary.drain_reason, "duration elapsed");
    assert!(outcome.summary.lost_peers.contains(&"b".to_string()));
    assert!(outcome.summary.session_id.is_some());
}
