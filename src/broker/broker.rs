use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{HermesConfig, NodeErrorPolicy, NodeRole, PeerConfig};
use crate::core::{ReferenceClock, Session, StreamSpec};
use crate::error::{HermesError, Result};
use crate::keyboard::{KeyEvent, KeyboardHub};
use crate::node::{NodeCommand, NodeDescriptor, NodeHandle, NodeReply, NodeState, NodeStatus};
use crate::observability::{CountersSnapshot, MetricsCollector};
use crate::storage::{StorageEngine, StorageEvent};
use crate::transport::{
    spawn_control_listener, spawn_data_listener, ControlEvent, ControlKind, ControlLink,
    ControlMessage, DataLink, LocalBus,
};

use super::clock_sync::elect_reference;
use super::proxy::spawn_proxy;
use super::state::{BrokerEvent, BrokerPhase};

/// Pacing of re-dial attempts while a configured peer is not up yet.
const DIAL_RETRY: Duration = Duration::from_millis(200);

/// End-of-run report handed back to the supervisor.
#[derive(Debug)]
pub struct RunSummary {
    pub session_id: Option<String>,
    pub drain_reason: String,
    pub unflushed: u64,
    pub lost_peers: Vec<String>,
    pub counters: Vec<CountersSnapshot>,
}

/// Final outcome: the summary always exists, the error decides the exit
/// code.
#[derive(Debug)]
pub struct RunOutcome {
    pub summary: RunSummary,
    pub error: Option<HermesError>,
}

struct PeerEntry {
    config: PeerConfig,
    control: Option<ControlLink>,
    data: Option<Arc<DataLink>>,
    announced: Option<crate::transport::BrokerDescriptor>,
    sync_ok: bool,
    ready: bool,
    alive: bool,
}

/// What ended the RUN phase.
enum DrainTrigger {
    OperatorStop,
    DurationElapsed,
    PeerDrain(String),
    PeerError(String),
    Overflow(String),
    NodeFault(String),
    Abort,
}

impl DrainTrigger {
    fn reason(&self) -> String {
        match self {
            DrainTrigger::OperatorStop => "operator stop".into(),
            DrainTrigger::DurationElapsed => "duration elapsed".into(),
            DrainTrigger::PeerDrain(id) => format!("peer {} drained", id),
            DrainTrigger::PeerError(msg) => format!("peer error: {}", msg),
            DrainTrigger::Overflow(stream) => format!("storage overflow on {}", stream),
            DrainTrigger::NodeFault(msg) => format!("node fault: {}", msg),
            DrainTrigger::Abort => "user abort".into(),
        }
    }

    fn error(&self) -> Option<HermesError> {
        match self {
            DrainTrigger::Overflow(stream) => Some(HermesError::Overflow {
                stream_id: stream.clone(),
            }),
            DrainTrigger::NodeFault(msg) => Some(HermesError::Runtime(msg.clone())),
            DrainTrigger::PeerError(msg) => Some(HermesError::Runtime(msg.clone())),
            DrainTrigger::Abort => Some(HermesError::Aborted),
            _ => None,
        }
    }
}

/// Per-host lifecycle orchestrator: discovers peers, negotiates the
/// reference clock, drives the local nodes through the coordinated
/// lifecycle, and relays pub/sub traffic between the local bus and peer
/// brokers.
pub struct Broker {
    config: HermesConfig,
    clock: Arc<ReferenceClock>,
    bus: LocalBus,
    keyboard: Arc<KeyboardHub>,
    metrics: MetricsCollector,
    nodes: Vec<NodeHandle>,
    status_rx: mpsc::Receiver<NodeStatus>,
    storage: StorageEngine,
    storage_events: mpsc::UnboundedReceiver<StorageEvent>,
    local_nodes: Vec<NodeDescriptor>,
}

impl Broker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: HermesConfig,
        clock: Arc<ReferenceClock>,
        bus: LocalBus,
        keyboard: Arc<KeyboardHub>,
        metrics: MetricsCollector,
        nodes: Vec<NodeHandle>,
        status_rx: mpsc::Receiver<NodeStatus>,
        storage: StorageEngine,
        storage_events: mpsc::UnboundedReceiver<StorageEvent>,
        local_nodes: Vec<NodeDescriptor>,
    ) -> Self {
        Self {
            config,
            clock,
            bus,
            keyboard,
            metrics,
            nodes,
            status_rx,
            storage,
            storage_events,
            local_nodes,
        }
    }

    /// Runs the broker to completion, through every lifecycle phase.
    pub async fn run(self) -> RunOutcome {
        let Broker {
            config,
            clock,
            bus,
            keyboard,
            metrics,
            mut nodes,
            mut status_rx,
            storage,
            mut storage_events,
            local_nodes,
        } = self;
        let local_streams: Vec<StreamSpec> = local_nodes
            .iter()
            .flat_map(|n| n.output_streams.iter().cloned())
            .collect();

        let broker_id = config.broker_id.clone();
        let mut phase = BrokerPhase::Boot;
        let mut summary = RunSummary {
            session_id: None,
            drain_reason: String::new(),
            unflushed: 0,
            lost_peers: Vec::new(),
            counters: Vec::new(),
        };

        macro_rules! fail {
            ($err:expr) => {{
                let err = $err;
                error!(broker_id = %broker_id, phase = phase.name(), error = %err, "session failed");
                summary.counters = metrics.snapshot();
                for node in &mut nodes {
                    let _ = node.request(NodeCommand::Abort).await;
                    node.force_stop();
                }
                keyboard.post_shutdown();
                return RunOutcome {
                    summary,
                    error: Some(err),
                };
            }};
        }

        // BOOT: bind the local endpoints and start the listeners.
        let (control_tx, mut control_rx) = mpsc::channel::<ControlEvent>(256);
        let control_listener = match TcpListener::bind(&config.control_addr).await {
            Ok(l) => l,
            Err(e) => fail!(HermesError::Config(format!(
                "cannot bind control endpoint {}: {}",
                config.control_addr, e
            ))),
        };
        let data_listener = match TcpListener::bind(&config.data_addr).await {
            Ok(l) => l,
            Err(e) => fail!(HermesError::Config(format!(
                "cannot bind data endpoint {}: {}",
                config.data_addr, e
            ))),
        };
        spawn_control_listener(control_listener, control_tx);
        spawn_data_listener(data_listener, bus.clone());

        let descriptor = crate::transport::BrokerDescriptor {
            broker_id: broker_id.clone(),
            control_addr: config.control_addr.clone(),
            data_addr: config.data_addr.clone(),
            clock_eligible: config.clock_eligible,
            local_nodes: local_nodes.clone(),
        };
        let mut peers: HashMap<String, PeerEntry> = config
            .peers
            .iter()
            .map(|p| {
                (
                    p.broker_id.clone(),
                    PeerEntry {
                        config: p.clone(),
                        control: None,
                        data: None,
                        announced: None,
                        sync_ok: false,
                        ready: false,
                        alive: true,
                    },
                )
            })
            .collect();
        let mut pending: VecDeque<ControlMessage> = VecDeque::new();

        phase = phase.transition(BrokerEvent::BootCompleted).expect("boot exit");
        info!(broker_id = %broker_id, peers = peers.len(), "entering discovery");

        // DISCOVER: announce to every configured peer and await quorum.
        let discover_deadline =
            Instant::now() + Duration::from_millis(config.sync.discover_timeout_ms);
        if let Err(e) = discover(
            &broker_id,
            &clock,
            &descriptor,
            &mut peers,
            &mut control_rx,
            &mut pending,
            discover_deadline,
        )
        .await
        {
            fail!(e);
        }
        phase = phase.transition(BrokerEvent::QuorumReached).expect("discover exit");

        // SYNC: elect the reference clock and reach the offset barrier.
        let candidates: Vec<(String, bool)> = peers
            .values()
            .map(|p| {
                (
                    p.config.broker_id.clone(),
                    p.announced.as_ref().map(|d| d.clock_eligible).unwrap_or(false),
                )
            })
            .collect();
        let elected = match elect_reference(&broker_id, config.clock_eligible, &candidates) {
            Ok(id) => id,
            Err(e) => fail!(e),
        };
        info!(broker_id = %broker_id, reference = %elected, "reference clock elected");
        let sync_deadline = Instant::now() + Duration::from_millis(config.sync.sync_timeout_ms);
        if let Err(e) = sync_clocks(
            &broker_id,
            &clock,
            &elected,
            &mut peers,
            &mut control_rx,
            &mut pending,
            sync_deadline,
        )
        .await
        {
            fail!(e);
        }
        phase = phase.transition(BrokerEvent::SyncCompleted).expect("sync exit");

        // Peer data links come up before any publishing starts.
        for peer in peers.values_mut() {
            let addr = peer
                .announced
                .as_ref()
                .map(|d| d.data_addr.clone())
                .unwrap_or_else(|| peer.config.data_addr.clone());
            match DataLink::dial(&addr).await {
                Ok(link) => peer.data = Some(Arc::new(link)),
                Err(e) => fail!(HermesError::Transport(format!(
                    "cannot open data link to {}: {}",
                    peer.config.broker_id, e
                ))),
            }
        }

        // READY: local nodes first, then the peer barrier.
        let mut dead_nodes: Vec<String> = Vec::new();
        for i in 0..nodes.len() {
            let node_id = nodes[i].node_id.clone();
            let detail = match nodes[i].request(NodeCommand::Prepare).await {
                Ok(NodeReply::Accepted(NodeState::Ready)) => continue,
                Ok(NodeReply::Rejected(msg)) => msg,
                Ok(other) => format!("unexpected reply {:?}", other),
                Err(e) => e.to_string(),
            };
            match config.on_node_error {
                NodeErrorPolicy::FailHost => {
                    broadcast(&broker_id, &clock, &peers, ControlKind::Error {
                        message: format!("node {} failed: {}", node_id, detail),
                    })
                    .await;
                    fail!(HermesError::Device {
                        node_id,
                        message: detail,
                    });
                }
                NodeErrorPolicy::Degrade => {
                    warn!(node_id = %node_id, detail = %detail, "degrading without node");
                    dead_nodes.push(node_id);
                }
            }
        }
        broadcast(&broker_id, &clock, &peers, ControlKind::Ready).await;
        let ready_deadline = Instant::now() + Duration::from_millis(config.sync.sync_timeout_ms);
        let early_start = match ready_barrier(
            &elected,
            &mut peers,
            &mut control_rx,
            &mut pending,
            ready_deadline,
        )
        .await
        {
            Ok(start) => start,
            Err(e) => fail!(e),
        };
        phase = phase.transition(BrokerEvent::AllReady).expect("ready exit");

        // RUN entry: the reference broker stamps the session; everyone
        // else adopts the stamp from its START broadcast.
        let mut all_streams = local_streams.clone();
        for peer in peers.values() {
            if let Some(desc) = &peer.announced {
                all_streams.extend(desc.streams().cloned());
            }
        }
        let mut participating: Vec<String> = std::iter::once(broker_id.clone())
            .chain(peers.keys().cloned())
            .collect();
        participating.sort();

        let session = if elected == broker_id {
            let session = Session {
                session_id: Uuid::new_v4().to_string(),
                started_at_reference_ns: clock.reference_time_ns(),
                participating_brokers: participating,
                streams: all_streams,
            };
            broadcast(&broker_id, &clock, &peers, ControlKind::Start {
                session_id: session.session_id.clone(),
                started_at_reference_ns: session.started_at_reference_ns,
            })
            .await;
            session
        } else {
            let start = match early_start {
                Some(start) => Ok(start),
                None => {
                    let deadline =
                        Instant::now() + Duration::from_millis(config.sync.sync_timeout_ms);
                    await_start(&elected, &mut control_rx, &mut pending, deadline).await
                }
            };
            match start {
                Ok((session_id, started_at_reference_ns)) => Session {
                    session_id,
                    started_at_reference_ns,
                    participating_brokers: participating,
                    streams: all_streams,
                },
                Err(e) => fail!(e),
            }
        };
        summary.session_id = Some(session.session_id.clone());
        info!(
            broker_id = %broker_id,
            session_id = %session.session_id,
            started_at_reference_ns = session.started_at_reference_ns,
            "session running"
        );
        broadcast(&broker_id, &clock, &peers, ControlKind::Status {
            phase: BrokerPhase::Run.name().to_string(),
            detail: session.session_id.clone(),
        })
        .await;

        let storage_handle = match storage.start(
            session.clone(),
            config.experiment.clone(),
            config.digest(),
        ) {
            Ok(handle) => handle,
            Err(e) => fail!(e),
        };

        let links: Vec<(String, Arc<DataLink>)> = peers
            .iter()
            .filter_map(|(id, p)| p.data.as_ref().map(|l| (id.clone(), Arc::clone(l))))
            .collect();
        let proxy = spawn_proxy(&bus, links);

        let session = Arc::new(session);
        for i in 0..nodes.len() {
            let node_id = nodes[i].node_id.clone();
            if dead_nodes.contains(&node_id) {
                continue;
            }
            let detail = match nodes[i].request(NodeCommand::Start(Arc::clone(&session))).await {
                Ok(NodeReply::Accepted(_)) => continue,
                Ok(NodeReply::Rejected(msg)) => msg,
                Err(e) => e.to_string(),
            };
            warn!(node_id = %node_id, error = %detail, "node failed to start");
            match config.on_node_error {
                NodeErrorPolicy::FailHost => {
                    proxy.abort();
                    fail!(HermesError::Device {
                        node_id,
                        message: detail,
                    });
                }
                NodeErrorPolicy::Degrade => dead_nodes.push(node_id),
            }
        }

        // RUN: serve events until something requests the drain.
        let trigger = run_loop(
            &config,
            &keyboard,
            &mut control_rx,
            &mut pending,
            &mut status_rx,
            &mut storage_events,
            &mut peers,
            &mut summary.lost_peers,
        )
        .await;
        summary.drain_reason = trigger.reason();
        phase = phase.transition(BrokerEvent::DrainRequested).expect("run exit");
        info!(broker_id = %broker_id, reason = %summary.drain_reason, "entering drain");

        // DRAIN: unblock the keyboard reader, tell the peers, stop
        // producers first, let everyone else empty their queues.
        keyboard.post_shutdown();
        if !matches!(trigger, DrainTrigger::PeerDrain(_)) {
            broadcast(&broker_id, &clock, &peers, ControlKind::Drain {
                reason: summary.drain_reason.clone(),
            })
            .await;
        }

        let drain_deadline =
            Instant::now() + Duration::from_millis(config.storage.drain_deadline_ms);
        drain_nodes(&mut nodes, &dead_nodes, &mut status_rx, drain_deadline).await;

        let remaining = drain_deadline.saturating_duration_since(Instant::now());
        let report = storage_handle.drain(remaining.max(Duration::from_millis(1))).await;
        summary.unflushed = report.unflushed;
        if report.deadline_hit {
            warn!(
                unflushed = report.unflushed,
                "drain deadline expired, unflushed samples discarded"
            );
        }
        phase = phase.transition(BrokerEvent::DrainCompleted).expect("drain exit");

        // STOP: tear everything down and report.
        broadcast(&broker_id, &clock, &peers, ControlKind::Stop).await;
        proxy.abort();
        for node in &mut nodes {
            node.force_stop();
        }
        let mut storage_handle = storage_handle;
        if let Err(e) = storage_handle.join() {
            warn!(error = %e, "storage shutdown reported an error");
        }
        summary.counters = metrics.snapshot();
        debug_assert!(phase.is_terminal() || phase == BrokerPhase::Stop);
        info!(broker_id = %broker_id, session_id = ?summary.session_id, "session stopped");

        RunOutcome {
            summary,
            error: trigger.error(),
        }
    }
}

async fn broadcast(
    broker_id: &str,
    clock: &ReferenceClock,
    peers: &HashMap<String, PeerEntry>,
    kind: ControlKind,
) {
    for peer in peers.values() {
        if let Some(link) = &peer.control {
            let msg = ControlMessage {
                sender_id: broker_id.to_string(),
                monotonic_ns: clock.monotonic_ns(),
                kind: kind.clone(),
            };
            let _ = link.send(msg).await;
        }
    }
}

async fn next_message(
    control_rx: &mut mpsc::Receiver<ControlEvent>,
    pending: &mut VecDeque<ControlMessage>,
    deadline: Instant,
    peers: &mut HashMap<String, PeerEntry>,
) -> Result<Option<ControlMessage>> {
    if let Some(msg) = pending.pop_front() {
        return Ok(Some(msg));
    }
    loop {
        match timeout_at(deadline, control_rx.recv()).await {
            Ok(Some(ControlEvent::Message(msg))) => return Ok(Some(msg)),
            Ok(Some(ControlEvent::PeerLost { broker_id })) => {
                if let Some(id) = broker_id {
                    if let Some(peer) = peers.get_mut(&id) {
                        peer.alive = false;
                    }
                }
                continue;
            }
            Ok(None) => {
                return Err(HermesError::Transport("control listener went away".into()))
            }
            Err(_) => return Ok(None),
        }
    }
}

async fn discover(
    broker_id: &str,
    clock: &ReferenceClock,
    descriptor: &crate::transport::BrokerDescriptor,
    peers: &mut HashMap<String, PeerEntry>,
    control_rx: &mut mpsc::Receiver<ControlEvent>,
    pending: &mut VecDeque<ControlMessage>,
    deadline: Instant,
) -> Result<()> {
    // Bring up the outbound links, announcing on each as it connects.
    loop {
        let mut all_connected = true;
        for peer in peers.values_mut() {
            if peer.control.is_some() {
                continue;
            }
            match ControlLink::dial(&peer.config.control_addr).await {
                Ok(link) => {
                    link.send(ControlMessage {
                        sender_id: broker_id.to_string(),
                        monotonic_ns: clock.monotonic_ns(),
                        kind: ControlKind::Announce {
                            descriptor: descriptor.clone(),
                        },
                    })
                    .await?;
                    peer.control = Some(link);
                }
                Err(_) => all_connected = false,
            }
        }
        if all_connected {
            break;
        }
        if Instant::now() >= deadline {
            let missing: Vec<&str> = peers
                .values()
                .filter(|p| p.control.is_none())
                .map(|p| p.config.broker_id.as_str())
                .collect();
            return Err(HermesError::Discovery(format!(
                "peers unreachable within deadline: {}",
                missing.join(", ")
            )));
        }
        tokio::time::sleep(DIAL_RETRY).await;
    }

    // Quorum: every configured peer announced itself to us. Unrelated
    // traffic is stashed for the later phases, never re-queued into the
    // queue this loop pops from.
    let mut stash: VecDeque<ControlMessage> = VecDeque::new();
    while peers.values().any(|p| p.announced.is_none()) {
        match next_message(control_rx, pending, deadline, peers).await? {
            Some(msg) => match msg.kind {
                ControlKind::Announce { descriptor } => {
                    match peers.get_mut(&msg.sender_id) {
                        Some(peer) => peer.announced = Some(descriptor),
                        None => {
                            warn!(sender_id = %msg.sender_id, "announce from unconfigured broker")
                        }
                    }
                }
                _ => stash.push_back(msg),
            },
            None => {
                let missing: Vec<&str> = peers
                    .values()
                    .filter(|p| p.announced.is_none())
                    .map(|p| p.config.broker_id.as_str())
                    .collect();
                return Err(HermesError::Discovery(format!(
                    "no announce from: {}",
                    missing.join(", ")
                )));
            }
        }
    }
    pending.append(&mut stash);
    Ok(())
}

async fn sync_clocks(
    broker_id: &str,
    clock: &Arc<ReferenceClock>,
    elected: &str,
    peers: &mut HashMap<String, PeerEntry>,
    control_rx: &mut mpsc::Receiver<ControlEvent>,
    pending: &mut VecDeque<ControlMessage>,
    deadline: Instant,
) -> Result<()> {
    let is_reference = elected == broker_id;
    let mut synced = is_reference;
    if is_reference {
        clock.anchor_to_epoch();
        broadcast(broker_id, clock, peers, ControlKind::SyncOk {
            elected: elected.to_string(),
        })
        .await;
    } else {
        let reference = peers
            .get(elected)
            .and_then(|p| p.control.as_ref())
            .ok_or_else(|| {
                HermesError::Sync(format!("elected reference {} is not a reachable peer", elected))
            })?;
        reference
            .send(ControlMessage {
                sender_id: broker_id.to_string(),
                monotonic_ns: clock.monotonic_ns(),
                kind: ControlKind::SyncProbe {
                    t0_ns: clock.monotonic_ns(),
                },
            })
            .await?;
    }

    // Barrier: nobody leaves SYNC before every peer acknowledged with a
    // matching election.
    let mut stash: VecDeque<ControlMessage> = VecDeque::new();
    while !synced || peers.values().any(|p| !p.sync_ok) {
        let msg = next_message(control_rx, pending, deadline, peers)
            .await?
            .ok_or_else(|| {
                HermesError::Sync(format!(
                    "sync barrier incomplete within deadline (synced={})",
                    synced
                ))
            })?;
        match msg.kind {
            ControlKind::SyncProbe { t0_ns } => {
                // Only the reference answers probes.
                if is_reference {
                    if let Some(link) = peers.get(&msg.sender_id).and_then(|p| p.control.as_ref()) {
                        let _ = link
                            .send(ControlMessage {
                                sender_id: broker_id.to_string(),
                                monotonic_ns: clock.monotonic_ns(),
                                kind: ControlKind::SyncReply {
                                    t0_ns,
                                    reference_ts_ns: clock.reference_time_ns(),
                                },
                            })
                            .await;
                    }
                }
            }
            ControlKind::SyncReply {
                t0_ns,
                reference_ts_ns,
            } => {
                if is_reference {
                    // A second broker believes it is the reference.
                    return Err(HermesError::Sync(format!(
                        "conflicting reference claim from {}",
                        msg.sender_id
                    )));
                }
                if !synced {
                    let t1 = clock.monotonic_ns();
                    clock.set_offset_ns(ReferenceClock::offset_from_exchange(
                        t0_ns,
                        t1,
                        reference_ts_ns,
                    ));
                    synced = true;
                    broadcast(broker_id, clock, peers, ControlKind::SyncOk {
                        elected: elected.to_string(),
                    })
                    .await;
                }
            }
            ControlKind::SyncOk { elected: theirs } => {
                if theirs != elected {
                    return Err(HermesError::Sync(format!(
                        "split reference configuration: {} elected {}, we elected {}",
                        msg.sender_id, theirs, elected
                    )));
                }
                if let Some(peer) = peers.get_mut(&msg.sender_id) {
                    peer.sync_ok = true;
                }
            }
            ControlKind::Error { message } => {
                return Err(HermesError::Sync(format!(
                    "peer {} failed during sync: {}",
                    msg.sender_id, message
                )));
            }
            _ => stash.push_back(msg),
        }
    }
    pending.append(&mut stash);
    Ok(())
}

/// Waits for ALL_READY from every peer. A START arriving early implies
/// the reference already saw the full barrier, so it completes ours too.
async fn ready_barrier(
    elected: &str,
    peers: &mut HashMap<String, PeerEntry>,
    control_rx: &mut mpsc::Receiver<ControlEvent>,
    pending: &mut VecDeque<ControlMessage>,
    deadline: Instant,
) -> Result<Option<(String, i64)>> {
    let mut stash: VecDeque<ControlMessage> = VecDeque::new();
    while peers.values().any(|p| !p.ready) {
        let msg = next_message(control_rx, pending, deadline, peers)
            .await?
            .ok_or_else(|| HermesError::Sync("peers not ready within deadline".into()))?;
        match msg.kind {
            ControlKind::Ready => {
                if let Some(peer) = peers.get_mut(&msg.sender_id) {
                    peer.ready = true;
                }
            }
            ControlKind::Start {
                session_id,
                started_at_reference_ns,
            } if msg.sender_id == elected => {
                pending.append(&mut stash);
                return Ok(Some((session_id, started_at_reference_ns)));
            }
            ControlKind::Error { message } => {
                return Err(HermesError::Runtime(format!(
                    "peer {} failed before start: {}",
                    msg.sender_id, message
                )));
            }
            _ => stash.push_back(msg),
        }
    }
    pending.append(&mut stash);
    Ok(None)
}

async fn await_start(
    elected: &str,
    control_rx: &mut mpsc::Receiver<ControlEvent>,
    pending: &mut VecDeque<ControlMessage>,
    deadline: Instant,
) -> Result<(String, i64)> {
    let mut ignored: HashMap<String, PeerEntry> = HashMap::new();
    // Unrelated traffic is stashed aside, not pushed back into the
    // queue this loop itself pops from.
    let mut stash: VecDeque<ControlMessage> = VecDeque::new();
    loop {
        let msg = next_message(control_rx, pending, deadline, &mut ignored)
            .await?
            .ok_or_else(|| {
                HermesError::Sync(format!("no session start from reference {}", elected))
            })?;
        match msg.kind {
            ControlKind::Start {
                session_id,
                started_at_reference_ns,
            } if msg.sender_id == elected => {
                pending.append(&mut stash);
                return Ok((session_id, started_at_reference_ns));
            }
            ControlKind::Error { message } => {
                return Err(HermesError::Runtime(format!(
                    "peer {} failed before start: {}",
                    msg.sender_id, message
                )));
            }
            _ => stash.push_back(msg),
        }
    }
}

async fn run_loop(
    config: &HermesConfig,
    keyboard: &KeyboardHub,
    control_rx: &mut mpsc::Receiver<ControlEvent>,
    pending: &mut VecDeque<ControlMessage>,
    status_rx: &mut mpsc::Receiver<NodeStatus>,
    storage_events: &mut mpsc::UnboundedReceiver<StorageEvent>,
    peers: &mut HashMap<String, PeerEntry>,
    lost_peers: &mut Vec<String>,
) -> DrainTrigger {
    // Control traffic stashed while the barriers were running is served
    // before anything new.
    while let Some(msg) = pending.pop_front() {
        match msg.kind {
            ControlKind::Drain { .. } => return DrainTrigger::PeerDrain(msg.sender_id),
            ControlKind::Error { message } => {
                return DrainTrigger::PeerError(format!("{}: {}", msg.sender_id, message))
            }
            _ => {}
        }
    }

    let mut keys = keyboard.subscribe();
    let run_deadline = config
        .duration_s
        .map(|secs| Instant::now() + Duration::from_secs_f64(secs));
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = async {
                match run_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => return DrainTrigger::DurationElapsed,

            _ = &mut ctrl_c => return DrainTrigger::Abort,

            event = control_rx.recv() => match event {
                Some(ControlEvent::Message(msg)) => match msg.kind {
                    ControlKind::Drain { .. } => return DrainTrigger::PeerDrain(msg.sender_id),
                    ControlKind::Error { message } => {
                        return DrainTrigger::PeerError(format!("{}: {}", msg.sender_id, message))
                    }
                    ControlKind::Status { .. } | ControlKind::Stop => {}
                    other => {
                        warn!(sender_id = %msg.sender_id, kind = ?other, "unexpected control message in RUN");
                    }
                },
                Some(ControlEvent::PeerLost { broker_id }) => {
                    // Keep serving local subscribers; the session is
                    // single-shot, no reconnect.
                    if let Some(id) = broker_id {
                        warn!(peer = %id, "peer lost during RUN, continuing degraded");
                        if let Some(peer) = peers.get_mut(&id) {
                            peer.alive = false;
                        }
                        lost_peers.push(id);
                    } else {
                        warn!("unidentified peer connection dropped during RUN");
                    }
                }
                None => return DrainTrigger::NodeFault("control plane went away".into()),
            },

            status = status_rx.recv() => match status {
                Some(NodeStatus::Fault { node_id, message, fatal }) => {
                    if fatal && config.on_node_error == NodeErrorPolicy::FailHost {
                        return DrainTrigger::NodeFault(format!("{}: {}", node_id, message));
                    }
                    warn!(node_id = %node_id, message = %message, "node fault, continuing degraded");
                }
                Some(NodeStatus::EndOfStream { node_id, stream_id }) => {
                    info!(node_id = %node_id, stream_id = %stream_id, "end of stream");
                }
                Some(NodeStatus::StateChanged { .. }) | None => {}
            },

            storage_event = storage_events.recv() => match storage_event {
                Some(StorageEvent::Overflow { stream_id }) => {
                    return DrainTrigger::Overflow(stream_id)
                }
                None => {}
            },

            key = keys.recv() => match key {
                Ok(KeyEvent::Line(line)) => {
                    let cmd = line.trim();
                    if cmd.eq_ignore_ascii_case("q")
                        || cmd.eq_ignore_ascii_case("quit")
                        || cmd.eq_ignore_ascii_case("stop")
                    {
                        return DrainTrigger::OperatorStop;
                    }
                }
                Ok(KeyEvent::Shutdown) => return DrainTrigger::OperatorStop,
                Err(_) => {}
            },
        }
    }
}

/// Producers stop first; consumers, pipelines and storage then empty
/// their queues inside the drain deadline.
async fn drain_nodes(
    nodes: &mut [NodeHandle],
    dead_nodes: &[String],
    status_rx: &mut mpsc::Receiver<NodeStatus>,
    deadline: Instant,
) {
    for stage in [
        &[NodeRole::Producer][..],
        &[NodeRole::Consumer, NodeRole::Pipeline][..],
    ] {
        let mut waiting: Vec<String> = Vec::new();
        for node in nodes.iter() {
            if dead_nodes.contains(&node.node_id) || !stage.contains(&node.role) {
                continue;
            }
            match node.request(NodeCommand::Stop).await {
                Ok(NodeReply::Accepted(_)) => waiting.push(node.node_id.clone()),
                Ok(NodeReply::Rejected(msg)) => {
                    warn!(node_id = %node.node_id, msg = %msg, "stop rejected")
                }
                Err(e) => warn!(node_id = %node.node_id, error = %e, "stop failed"),
            }
        }

        // Collect DONE (or ERROR) from each stopped node.
        while !waiting.is_empty() {
            match timeout_at(deadline, status_rx.recv()).await {
                Ok(Some(NodeStatus::StateChanged { node_id, state }))
                    if state.is_terminal() =>
                {
                    waiting.retain(|id| id != &node_id);
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    warn!(stragglers = ?waiting, "drain deadline hit, forcing stop");
                    for node in nodes.iter_mut() {
                        if waiting.contains(&node.node_id) {
                            node.force_stop();
                        }
                    }
                    return;
                }
            }
        }
    }
}
