use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::{DataMessage, Payload, ReferenceClock, Sample, Session, StreamSpec};
use crate::observability::StreamCounters;
use crate::storage::StreamSink;
use crate::transport::LocalBus;

use super::{NodeStatus, RoleWorker};

/// Per-sample reaction of the synchronous ingest worker. Returning a
/// payload emits one derived sample on the pipeline's ingest output
/// stream.
pub trait IngestTransform: Send {
    fn on_sample(&mut self, msg: &DataMessage) -> Result<Option<Payload>>;
}

/// Re-emits every tabular sample unchanged. The stand-in transform used
/// when no user transform is configured, mirroring a prediction worker
/// that forwards features downstream.
pub struct RelayTransform;

impl IngestTransform for RelayTransform {
    fn on_sample(&mut self, msg: &DataMessage) -> Result<Option<Payload>> {
        Ok(Some(msg.payload.clone()))
    }
}

/// Pipeline role: a synchronous ingest worker (subscribe, react, emit)
/// and an asynchronous generator worker (internally-triggered outputs).
/// The two workers share nothing but their ownership-disjoint outbound
/// streams, so no cross-worker locks exist.
pub struct PipelineWorker {
    node_id: String,
    publisher_id: String,
    topics: Vec<String>,
    /// First output stream feeds the ingest worker, an optional second
    /// one feeds the generator.
    outputs: Vec<StreamSpec>,
    transform: Option<Box<dyn IngestTransform>>,
    sinks: HashMap<String, StreamSink>,
    counters: HashMap<String, Arc<StreamCounters>>,
    bus: LocalBus,
    clock: Arc<ReferenceClock>,
    generator_period: Option<Duration>,
    status_tx: mpsc::Sender<NodeStatus>,
    cancel_tx: Option<watch::Sender<bool>>,
    drain_tx: Option<watch::Sender<bool>>,
    ingest_task: Option<JoinHandle<()>>,
    generator_task: Option<JoinHandle<()>>,
}

impl PipelineWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: impl Into<String>,
        broker_id: &str,
        topics: Vec<String>,
        outputs: Vec<StreamSpec>,
        transform: Box<dyn IngestTransform>,
        sinks: HashMap<String, StreamSink>,
        counters: HashMap<String, Arc<StreamCounters>>,
        bus: LocalBus,
        clock: Arc<ReferenceClock>,
        generator_period: Option<Duration>,
        status_tx: mpsc::Sender<NodeStatus>,
    ) -> Self {
        let node_id = node_id.into();
        Self {
            publisher_id: format!("{}/{}", broker_id, node_id),
            node_id,
            topics,
            outputs,
            transform: Some(transform),
            sinks,
            counters,
            bus,
            clock,
            generator_period,
            status_tx,
            cancel_tx: None,
            drain_tx: None,
            ingest_task: None,
            generator_task: None,
        }
    }

    fn emitter_for(&mut self, stream_index: usize) -> Option<StreamEmitter> {
        let spec = self.outputs.get(stream_index)?.clone();
        let sink = self.sinks.remove(&spec.stream_id);
        let counters = self.counters.get(&spec.stream_id).cloned();
        Some(StreamEmitter {
            topic: spec.topic(),
            stream_id: spec.stream_id,
            publisher_id: self.publisher_id.clone(),
            seq: 0,
            sink,
            counters,
            bus: self.bus.clone(),
            clock: Arc::clone(&self.clock),
        })
    }
}

#[async_trait]
impl RoleWorker for PipelineWorker {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn init(&mut self) -> Result<()> {
        Ok(())
    }

    async fn prepare(&mut self) -> Result<()> {
        if self.outputs.is_empty() {
            return Err(anyhow!("pipeline has no output streams"));
        }
        Ok(())
    }

    async fn start(&mut self, _session: Arc<Session>) -> Result<()> {
        let transform = self.transform.take().ok_or_else(|| anyhow!("pipeline already started"))?;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (drain_tx, drain_rx) = watch::channel(false);
        self.cancel_tx = Some(cancel_tx);
        self.drain_tx = Some(drain_tx);

        let ingest_emitter = self
            .emitter_for(0)
            .ok_or_else(|| anyhow!("pipeline has no ingest output stream"))?;
        let subscription = self.bus.subscribe(self.topics.clone());
        let node_id = self.node_id.clone();
        self.ingest_task = Some(tokio::spawn(ingest_loop(
            node_id,
            subscription,
            transform,
            ingest_emitter,
            cancel_rx.clone(),
            drain_rx.clone(),
        )));

        if let Some(period) = self.generator_period {
            if let Some(emitter) = self.emitter_for(1) {
                self.generator_task =
                    Some(tokio::spawn(generator_loop(emitter, period, cancel_rx, drain_rx)));
            }
        }
        Ok(())
    }

    async fn drain(&mut self) -> Result<()> {
        if let Some(drain) = &self.drain_tx {
            let _ = drain.send(true);
        }
        if let Some(task) = self.ingest_task.take() {
            task.await.map_err(|e| anyhow!("ingest worker panicked: {}", e))?;
        }
        if let Some(task) = self.generator_task.take() {
            task.await.map_err(|e| anyhow!("generator worker panicked: {}", e))?;
        }
        Ok(())
    }

    async fn abort(&mut self) {
        if let Some(cancel) = &self.cancel_tx {
            let _ = cancel.send(true);
        }
        if let Some(task) = self.ingest_task.take() {
            task.abort();
        }
        if let Some(task) = self.generator_task.take() {
            task.abort();
        }
    }
}

/// Everything one worker needs to publish on one outbound stream.
struct StreamEmitter {
    stream_id: String,
    topic: String,
    publisher_id: String,
    seq: u64,
    sink: Option<StreamSink>,
    counters: Option<Arc<StreamCounters>>,
    bus: LocalBus,
    clock: Arc<ReferenceClock>,
}

impl StreamEmitter {
    fn emit(&mut self, payload: Payload) {
        let sample = Sample {
            stream_id: self.stream_id.clone(),
            seq: self.seq,
            reference_ts_ns: self.clock.reference_time_ns(),
            device_ts_ns: None,
            payload,
        };
        self.seq += 1;
        if let Some(sink) = &mut self.sink {
            let _ = sink.commit(sample.clone());
        }
        self.bus
            .publish_local(DataMessage::from_sample(&*self.topic, &*self.publisher_id, &sample));
        if let Some(counters) = &self.counters {
            counters.record_published();
        }
    }
}

async fn ingest_loop(
    node_id: String,
    mut subscription: crate::transport::BusSubscription,
    mut transform: Box<dyn IngestTransform>,
    mut emitter: StreamEmitter,
    mut cancel_rx: watch::Receiver<bool>,
    mut drain_rx: watch::Receiver<bool>,
) {
    loop {
        let draining = *drain_rx.borrow();
        let msg = tokio::select! {
            _ = cancel_rx.changed() => break,
            _ = drain_rx.changed() => continue,
            msg = subscription.recv() => msg,
            _ = tokio::time::sleep(Duration::from_millis(100)), if draining => None,
        };
        let Some(msg) = msg else { break };

        match transform.on_sample(msg.as_ref()) {
            Ok(Some(payload)) => emitter.emit(payload),
            Ok(None) => {}
            Err(_) => {
                if let Some(counters) = &emitter.counters {
                    counters.record_transient_error();
                }
            }
        }
    }
    debug!(node_id = %node_id, "pipeline ingest worker exited");
}

async fn generator_loop(
    mut emitter: StreamEmitter,
    period: Duration,
    mut cancel_rx: watch::Receiver<bool>,
    mut drain_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    let mut tick_no = 0u64;
    loop {
        tokio::select! {
            _ = cancel_rx.changed() => break,
            _ = drain_rx.changed() => {
                if *drain_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                emitter.emit(Payload::Tabular(vec![tick_no as f64]));
                tick_no += 1;
            }
        }
    }
    debug!("pipeline generator worker exited");
}
