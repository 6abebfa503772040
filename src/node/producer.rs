use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tracing::{debug, warn};

use crate::core::{DataMessage, Payload, ReferenceClock, Sample, Session, StreamSpec};
use crate::delay::{DelayEstimator, SampleMeta};
use crate::drivers::SensorSource;
use crate::observability::StreamCounters;
use crate::storage::StreamSink;
use crate::transport::LocalBus;

use super::{NodeStatus, RoleWorker};

/// Consecutive read failures a source may show before the producer
/// declares a persistent device fault.
const DEVICE_FAULT_THRESHOLD: u32 = 5;

/// Producer role: owns one sensor source, stamps its readings on the
/// reference clock, commits them to the storage rings, and publishes
/// them on the bus. Production runs on a dedicated worker task so the
/// coordination reply path never blocks on device I/O.
pub struct ProducerWorker {
    node_id: String,
    publisher_id: String,
    source: Option<Box<dyn SensorSource>>,
    streams: Vec<StreamSpec>,
    sinks: HashMap<String, StreamSink>,
    counters: HashMap<String, Arc<StreamCounters>>,
    bus: LocalBus,
    clock: Arc<ReferenceClock>,
    /// Delay correction per stream; streams without an entry get no
    /// correction.
    delays: HashMap<String, Arc<dyn DelayEstimator>>,
    status_tx: mpsc::Sender<NodeStatus>,
    probe_period: Option<Duration>,
    cancel_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl ProducerWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: impl Into<String>,
        broker_id: &str,
        source: Box<dyn SensorSource>,
        streams: Vec<StreamSpec>,
        sinks: HashMap<String, StreamSink>,
        counters: HashMap<String, Arc<StreamCounters>>,
        bus: LocalBus,
        clock: Arc<ReferenceClock>,
        delays: HashMap<String, Arc<dyn DelayEstimator>>,
        status_tx: mpsc::Sender<NodeStatus>,
        probe_period: Option<Duration>,
    ) -> Self {
        let node_id = node_id.into();
        Self {
            publisher_id: format!("{}/{}", broker_id, node_id),
            node_id,
            source: Some(source),
            streams,
            sinks,
            counters,
            bus,
            clock,
            delays,
            status_tx,
            probe_period,
            cancel_tx: None,
            task: None,
        }
    }
}

#[async_trait]
impl RoleWorker for ProducerWorker {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn init(&mut self) -> Result<()> {
        self.source
            .as_mut()
            .ok_or_else(|| anyhow!("source already taken"))?
            .open()
            .await
    }

    async fn prepare(&mut self) -> Result<()> {
        self.source
            .as_mut()
            .ok_or_else(|| anyhow!("source already taken"))?
            .self_test()
            .await
    }

    async fn start(&mut self, _session: Arc<Session>) -> Result<()> {
        let mut source = self.source.take().ok_or_else(|| anyhow!("producer already started"))?;
        source.start().await?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancel_tx = Some(cancel_tx);

        let loop_ctx = ProductionLoop {
            node_id: self.node_id.clone(),
            publisher_id: self.publisher_id.clone(),
            specs: self.streams.iter().map(|s| (s.stream_id.clone(), s.clone())).collect(),
            sinks: std::mem::take(&mut self.sinks),
            counters: self.counters.clone(),
            bus: self.bus.clone(),
            clock: Arc::clone(&self.clock),
            delays: self.delays.clone(),
            status_tx: self.status_tx.clone(),
            probe_period: self.probe_period,
        };
        self.task = Some(tokio::spawn(loop_ctx.run(source, cancel_rx)));
        Ok(())
    }

    async fn drain(&mut self) -> Result<()> {
        if let Some(cancel) = &self.cancel_tx {
            let _ = cancel.send(true);
        }
        if let Some(task) = self.task.take() {
            task.await.map_err(|e| anyhow!("production worker panicked: {}", e))?;
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

struct ProductionLoop {
    node_id: String,
    publisher_id: String,
    specs: HashMap<String, StreamSpec>,
    sinks: HashMap<String, StreamSink>,
    counters: HashMap<String, Arc<StreamCounters>>,
    bus: LocalBus,
    clock: Arc<ReferenceClock>,
    delays: HashMap<String, Arc<dyn DelayEstimator>>,
    status_tx: mpsc::Sender<NodeStatus>,
    probe_period: Option<Duration>,
}

impl ProductionLoop {
    async fn run(mut self, mut source: Box<dyn SensorSource>, mut cancel_rx: watch::Receiver<bool>) {
        let mut seqs: HashMap<String, u64> = HashMap::new();
        let mut probe = self.probe_period.map(|p| tokio::time::interval_at(Instant::now() + p, p));
        let mut probe_seq = 0u64;
        let mut consecutive_errors = 0u32;

        enum Wake {
            Cancel,
            ProbeDue,
            Read(Result<Option<crate::drivers::SensorReading>>),
        }

        loop {
            // The read future must be dropped before the probe touches
            // the source again, hence the scoped select.
            let wake = {
                let read_fut = source.read();
                tokio::pin!(read_fut);
                tokio::select! {
                    _ = cancel_rx.changed() => Wake::Cancel,
                    _ = probe_tick(&mut probe) => Wake::ProbeDue,
                    reading = &mut read_fut => Wake::Read(reading),
                }
            };

            match wake {
                Wake::Cancel => break,
                Wake::ProbeDue => {
                    probe_seq += 1;
                    self.run_probe(&mut source, probe_seq).await;
                }
                Wake::Read(Ok(Some(reading))) => {
                    consecutive_errors = 0;
                    self.publish_reading(reading, &mut seqs);
                }
                Wake::Read(Ok(None)) => break,
                Wake::Read(Err(e)) => {
                    consecutive_errors += 1;
                    if let Some(counters) = self.counters.values().next() {
                        counters.record_transient_error();
                    }
                    if consecutive_errors >= DEVICE_FAULT_THRESHOLD {
                        warn!(node_id = %self.node_id, error = %e, "persistent device fault");
                        let _ = self
                            .status_tx
                            .send(NodeStatus::Fault {
                                node_id: self.node_id.clone(),
                                message: format!("device: {}", e),
                                fatal: true,
                            })
                            .await;
                        break;
                    }
                    debug!(node_id = %self.node_id, error = %e, "transient device error");
                }
            }
        }

        let _ = source.stop().await;
        for stream_id in self.specs.keys() {
            let _ = self
                .status_tx
                .send(NodeStatus::EndOfStream {
                    node_id: self.node_id.clone(),
                    stream_id: stream_id.clone(),
                })
                .await;
        }
        let _ = source.close().await;
        debug!(node_id = %self.node_id, "production loop exited");
    }

    fn publish_reading(&mut self, reading: crate::drivers::SensorReading, seqs: &mut HashMap<String, u64>) {
        let Some(spec) = self.specs.get(&reading.stream_id) else {
            if let Some(counters) = self.counters.get(&reading.stream_id) {
                counters.record_transient_error();
            }
            warn!(node_id = %self.node_id, stream_id = %reading.stream_id, "reading on undeclared stream");
            return;
        };

        let meta = SampleMeta {
            device_ts_ns: reading.device_ts_ns,
            payload_len: reading.payloads.first().map(Payload::len).unwrap_or(0),
        };
        // One stamp per device wake: burst payloads share it, and the
        // stream's delay hook shifts it back to the sensed moment.
        let delay_ns = self
            .delays
            .get(&reading.stream_id)
            .map(|estimator| estimator.delay_ns(&reading.stream_id, &meta))
            .unwrap_or(0);
        let reference_ts_ns = self.clock.reference_time_ns() - delay_ns;

        let topic = spec.topic();
        for payload in reading.payloads {
            let seq = seqs.entry(reading.stream_id.clone()).or_insert(0);
            let sample = Sample {
                stream_id: reading.stream_id.clone(),
                seq: *seq,
                reference_ts_ns,
                device_ts_ns: reading.device_ts_ns,
                payload,
            };
            *seq += 1;

            if let Some(sink) = self.sinks.get_mut(&reading.stream_id) {
                // Overflow already went to the broker through the
                // storage event channel; publishing continues until the
                // coordinated drain reaches us.
                let _ = sink.commit(sample.clone());
            }
            self.bus
                .publish_local(DataMessage::from_sample(&*topic, &*self.publisher_id, &sample));
            if let Some(counters) = self.counters.get(&reading.stream_id) {
                counters.record_published();
            }
        }
    }

    /// Transmission-delay probe: measures the device round-trip and
    /// publishes half of it on the node's connection side-topic.
    async fn run_probe(&mut self, source: &mut Box<dyn SensorSource>, probe_seq: u64) {
        let started = std::time::Instant::now();
        if source.ping().await.is_err() {
            return;
        }
        let one_way_s = started.elapsed().as_secs_f64() / 2.0;
        let msg = DataMessage {
            topic: format!("{}.connection", self.node_id),
            publisher_id: self.publisher_id.clone(),
            seq: probe_seq,
            reference_ts_ns: self.clock.reference_time_ns(),
            device_ts_ns: None,
            payload: Payload::Tabular(vec![one_way_s]),
        };
        self.bus.publish_local(msg);
    }
}

async fn probe_tick(probe: &mut Option<Interval>) {
    match probe {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
