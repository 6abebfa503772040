use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;

use crate::broker::{Broker, RunOutcome, RunSummary};
use crate::config::{HermesConfig, NodeConfig, NodeRole, StreamConfig};
use crate::core::{ReferenceClock, Schema, StreamSpec};
use crate::delay::{self, DelayEstimator};
use crate::drivers::{DriverContext, DriverRegistry};
use crate::error::{HermesError, Result};
use crate::keyboard::KeyboardHub;
use crate::node::{
    coordination_channel, ConsumerWorker, CountingSink, DebugSink, ManagedNode, NodeDescriptor,
    NodeHandle, PipelineWorker, ProducerWorker, RelayTransform, SampleCallback,
};
use crate::observability::MetricsCollector;
use crate::storage::StorageEngine;
use crate::transport::LocalBus;

/// Per-host runtime glue: builds the broker, nodes, storage, and
/// keyboard fan-out from one configuration object, runs the session to
/// completion, and tears everything down.
pub struct Host {
    config: HermesConfig,
    keyboard: Arc<KeyboardHub>,
    registry: DriverRegistry,
}

impl Host {
    pub fn new(config: HermesConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            keyboard: Arc::new(KeyboardHub::new(256)),
            registry: DriverRegistry::with_builtins(),
        })
    }

    /// Keyboard hub handle, usable to script operator input.
    pub fn keyboard(&self) -> Arc<KeyboardHub> {
        Arc::clone(&self.keyboard)
    }

    /// Replaces the driver registry, for deployments that add vendor
    /// drivers on top of the built-ins.
    pub fn set_registry(&mut self, registry: DriverRegistry) {
        self.registry = registry;
    }

    /// Runs the host session. `read_stdin` attaches the keyboard reader
    /// thread; harnesses that script input through the hub leave it off.
    pub async fn run(self, read_stdin: bool) -> RunOutcome {
        match self.build_and_run(read_stdin).await {
            Ok(outcome) => outcome,
            Err(err) => RunOutcome {
                summary: RunSummary {
                    session_id: None,
                    drain_reason: String::new(),
                    unflushed: 0,
                    lost_peers: Vec::new(),
                    counters: Vec::new(),
                },
                error: Some(err),
            },
        }
    }

    async fn build_and_run(self, read_stdin: bool) -> Result<RunOutcome> {
        let config = self.config;
        let clock = ReferenceClock::new();
        let bus = LocalBus::new(1024);
        let mut metrics = MetricsCollector::new();
        let host_id = hostname();
        let mut storage = StorageEngine::new(config.storage.clone(), &host_id, &config.broker_id);
        let ctx = DriverContext {
            keyboard: Arc::clone(&self.keyboard),
        };

        let (status_tx, status_rx) = mpsc::channel(64);
        let mut nodes: Vec<NodeHandle> = Vec::new();
        let mut local_nodes: Vec<NodeDescriptor> = Vec::new();

        for node_cfg in &config.nodes {
            let streams: Vec<StreamSpec> = node_cfg
                .streams
                .iter()
                .map(|s| stream_spec(node_cfg, s))
                .collect();
            local_nodes.push(NodeDescriptor {
                node_id: node_cfg.node_id.clone(),
                role: node_cfg.role,
                input_topics: node_cfg.topics.clone(),
                output_streams: streams.clone(),
            });

            let mut sinks = HashMap::new();
            let mut counters = HashMap::new();
            for spec in &streams {
                let stream_counters = metrics.register(spec.stream_id.clone());
                let sink = storage.register_stream(spec.clone(), Arc::clone(&stream_counters));
                sinks.insert(spec.stream_id.clone(), sink);
                counters.insert(spec.stream_id.clone(), stream_counters);
            }

            let (mut handle, endpoint) =
                coordination_channel(node_cfg.node_id.clone(), node_cfg.role, status_tx.clone());
            let managed = match node_cfg.role {
                NodeRole::Producer => {
                    let source = self
                        .registry
                        .create_source(&node_cfg.driver, &streams, &node_cfg.params, &ctx)
                        .map_err(|e| {
                            HermesError::Config(format!(
                                "node {}: {}",
                                node_cfg.node_id, e
                            ))
                        })?;
                    let delays: HashMap<String, Arc<dyn DelayEstimator>> = node_cfg
                        .streams
                        .iter()
                        .map(|s| {
                            (
                                s.stream_id.clone(),
                                delay::build_estimator(s.delay_estimator.as_ref()),
                            )
                        })
                        .collect();
                    ManagedNode::new(Box::new(ProducerWorker::new(
                        node_cfg.node_id.clone(),
                        &config.broker_id,
                        source,
                        streams,
                        sinks,
                        counters,
                        bus.clone(),
                        Arc::clone(&clock),
                        delays,
                        status_tx.clone(),
                        node_cfg.delay_probe_period_s.map(Duration::from_secs_f64),
                    )))
                }
                NodeRole::Consumer => {
                    let node_counters = metrics.register(node_cfg.node_id.clone());
                    ManagedNode::new(Box::new(ConsumerWorker::new(
                        node_cfg.node_id.clone(),
                        node_cfg.topics.clone(),
                        bus.clone(),
                        consumer_callback(node_cfg),
                        node_counters,
                        status_tx.clone(),
                    )))
                }
                NodeRole::Pipeline => {
                    let generator_period = node_cfg.params["generator_period_ms"]
                        .as_u64()
                        .map(Duration::from_millis);
                    ManagedNode::new(Box::new(PipelineWorker::new(
                        node_cfg.node_id.clone(),
                        &config.broker_id,
                        node_cfg.topics.clone(),
                        streams,
                        Box::new(RelayTransform),
                        sinks,
                        counters,
                        bus.clone(),
                        Arc::clone(&clock),
                        generator_period,
                        status_tx.clone(),
                    )))
                }
            };
            handle.attach(tokio::spawn(managed.run(endpoint)));
            nodes.push(handle);
        }
        drop(status_tx);

        let storage_events = storage.take_events();
        let broker = Broker::new(
            config,
            clock,
            bus,
            Arc::clone(&self.keyboard),
            metrics,
            nodes,
            status_rx,
            storage,
            storage_events,
            local_nodes,
        );

        let reader = if read_stdin {
            Some(self.keyboard.spawn_reader())
        } else {
            None
        };

        let outcome = broker.run().await;

        if let Some(reader) = reader {
            // The broker posted the sentinel on drain; the reader thread
            // unblocks even with stdin still open.
            let _ = reader.join();
        }
        report(&outcome);
        Ok(outcome)
    }
}

fn consumer_callback(node_cfg: &NodeConfig) -> Box<dyn SampleCallback> {
    match node_cfg.params["sink"].as_str() {
        Some("counting") => Box::new(CountingSink::new()),
        _ => Box::new(DebugSink),
    }
}

fn stream_spec(node_cfg: &NodeConfig, stream_cfg: &StreamConfig) -> StreamSpec {
    let schema = if stream_cfg.is_video {
        Schema::opaque()
    } else if stream_cfg.shape.is_empty() {
        Schema::tabular(vec![stream_cfg.channel_names.len().max(1)])
    } else {
        Schema::tabular(stream_cfg.shape.clone())
    };
    StreamSpec {
        stream_id: stream_cfg.stream_id.clone(),
        device_id: if stream_cfg.device_id.is_empty() {
            node_cfg.driver.clone()
        } else {
            stream_cfg.device_id.clone()
        },
        node_id: node_cfg.node_id.clone(),
        schema,
        nominal_rate_hz: stream_cfg.rate_hz,
        is_burst: stream_cfg.is_burst,
        is_video: stream_cfg.is_video,
        channel_names: stream_cfg.channel_names.clone(),
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn report(outcome: &RunOutcome) {
    let summary = &outcome.summary;
    info!(
        session_id = ?summary.session_id,
        drain_reason = %summary.drain_reason,
        unflushed = summary.unflushed,
        lost_peers = ?summary.lost_peers,
        "session summary"
    );
    for counters in &summary.counters {
        info!(
            stream_id = %counters.stream_id,
            published = counters.published,
            flushed = counters.flushed,
            dropped = counters.dropped,
            gaps = counters.gaps,
            transient_errors = counters.transient_errors,
            "stream summary"
        );
    }
}
