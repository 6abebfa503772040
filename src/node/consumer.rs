use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::{DataMessage, Session};
use crate::observability::StreamCounters;
use crate::transport::LocalBus;

use super::{NodeStatus, RoleWorker};

/// Callback errors tolerated per stream before the consumer declares a
/// persistent fault.
const CALLBACK_FAULT_THRESHOLD: u64 = 16;

/// How long an idle drain waits for stragglers before declaring the
/// queues empty.
const DRAIN_IDLE_WINDOW: Duration = Duration::from_millis(100);

/// User-supplied per-sample processing. Must return promptly; anything
/// slow belongs on the callback's own worker.
pub trait SampleCallback: Send {
    fn on_sample(&mut self, msg: &DataMessage) -> Result<()>;
}

/// Callback that traces every sample, the default sink for wiring tests.
pub struct DebugSink;

impl SampleCallback for DebugSink {
    fn on_sample(&mut self, msg: &DataMessage) -> Result<()> {
        debug!(topic = %msg.topic, seq = msg.seq, reference_ts_ns = msg.reference_ts_ns, "sample");
        Ok(())
    }
}

/// Callback that counts per-topic deliveries, used by tests and the
/// latency harness.
#[derive(Default)]
pub struct CountingSink {
    counts: Arc<std::sync::Mutex<HashMap<String, u64>>>,
}

impl CountingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts_handle(&self) -> Arc<std::sync::Mutex<HashMap<String, u64>>> {
        Arc::clone(&self.counts)
    }
}

impl SampleCallback for CountingSink {
    fn on_sample(&mut self, msg: &DataMessage) -> Result<()> {
        let mut counts = self
            .counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *counts.entry(msg.topic.clone()).or_insert(0) += 1;
        Ok(())
    }
}

/// Consumer role: subscribes to a topic set and feeds every sample to a
/// user callback, tracking per-publisher sequence gaps.
pub struct ConsumerWorker {
    node_id: String,
    topics: Vec<String>,
    bus: LocalBus,
    callback: Option<Box<dyn SampleCallback>>,
    counters: Arc<StreamCounters>,
    status_tx: mpsc::Sender<NodeStatus>,
    cancel_tx: Option<watch::Sender<bool>>,
    drain_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl ConsumerWorker {
    pub fn new(
        node_id: impl Into<String>,
        topics: Vec<String>,
        bus: LocalBus,
        callback: Box<dyn SampleCallback>,
        counters: Arc<StreamCounters>,
        status_tx: mpsc::Sender<NodeStatus>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            topics,
            bus,
            callback: Some(callback),
            counters,
            status_tx,
            cancel_tx: None,
            drain_tx: None,
            task: None,
        }
    }
}

#[async_trait]
impl RoleWorker for ConsumerWorker {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn init(&mut self) -> Result<()> {
        // Consumers have no device to acquire.
        Ok(())
    }

    async fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    async fn start(&mut self, _session: Arc<Session>) -> Result<()> {
        let callback = self.callback.take().ok_or_else(|| anyhow!("consumer already started"))?;
        let subscription = self.bus.subscribe(self.topics.clone());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (drain_tx, drain_rx) = watch::channel(false);
        self.cancel_tx = Some(cancel_tx);
        self.drain_tx = Some(drain_tx);

        let ctx = IngestLoop {
            node_id: self.node_id.clone(),
            counters: Arc::clone(&self.counters),
            status_tx: self.status_tx.clone(),
        };
        self.task = Some(tokio::spawn(ctx.run(subscription, callback, cancel_rx, drain_rx)));
        Ok(())
    }

    async fn drain(&mut self) -> Result<()> {
        // Keep ingesting until the queues go quiet, then stop.
        if let Some(drain) = &self.drain_tx {
            let _ = drain.send(true);
        }
        if let Some(task) = self.task.take() {
            task.await.map_err(|e| anyhow!("ingest worker panicked: {}", e))?;
        }
        Ok(())
    }

    async fn abort(&mut self) {
        if let Some(cancel) = &self.cancel_tx {
            let _ = cancel.send(true);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct IngestLoop {
    node_id: String,
    counters: Arc<StreamCounters>,
    status_tx: mpsc::Sender<NodeStatus>,
}

impl IngestLoop {
    async fn run(
        self,
        mut subscription: crate::transport::BusSubscription,
        mut callback: Box<dyn SampleCallback>,
        mut cancel_rx: watch::Receiver<bool>,
        mut drain_rx: watch::Receiver<bool>,
    ) {
        // Last seq seen per (publisher, topic), for gap accounting.
        let mut last_seq: HashMap<(String, String), u64> = HashMap::new();
        let mut callback_errors = 0u64;

        loop {
            let draining = *drain_rx.borrow();
            let msg = tokio::select! {
                _ = cancel_rx.changed() => break,
                _ = drain_rx.changed() => continue,
                msg = subscription.recv() => msg,
                _ = tokio::time::sleep(DRAIN_IDLE_WINDOW), if draining => None,
            };
            let Some(msg) = msg else {
                // Bus closed, or the drain window passed with nothing
                // left in flight.
                break;
            };

            let key = (msg.publisher_id.clone(), msg.topic.clone());
            if let Some(prev) = last_seq.get(&key) {
                if msg.seq > prev + 1 {
                    let missing = msg.seq - prev - 1;
                    self.counters.record_gap(missing);
                    warn!(node_id = %self.node_id, topic = %msg.topic, missing, "sequence gap");
                }
            }
            last_seq.insert(key, msg.seq);

            if let Err(e) = callback.on_sample(msg.as_ref()) {
                callback_errors += 1;
                self.counters.record_transient_error();
                if callback_errors >= CALLBACK_FAULT_THRESHOLD {
                    let _ = self
                        .status_tx
                        .send(NodeStatus::Fault {
                            node_id: self.node_id.clone(),
                            message: format!("callback: {}", e),
                            fatal: true,
                        })
                        .await;
                    break;
                }
            }
        }
        debug!(node_id = %self.node_id, "ingest loop exited");
    }
}
