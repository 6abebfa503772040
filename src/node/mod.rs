pub mod consumer;
pub mod pipeline;
pub mod producer;
pub mod runner;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::NodeRole;
use crate::core::{Session, StreamSpec};
use crate::error::{HermesError, Result};

pub use consumer::{ConsumerWorker, CountingSink, DebugSink, SampleCallback};
pub use pipeline::{PipelineWorker, RelayTransform, IngestTransform};
pub use producer::ProducerWorker;
pub use runner::ManagedNode;
pub use state::NodeState;

/// How long the broker waits for a coordination reply before treating
/// the node as unresponsive.
pub const COORDINATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Inventory entry the broker advertises for one node.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NodeDescriptor {
    pub node_id: String,
    pub role: NodeRole,
    pub input_topics: Vec<String>,
    pub output_streams: Vec<StreamSpec>,
}

/// Commands on the broker-to-node coordination channel.
#[derive(Debug, Clone)]
pub enum NodeCommand {
    Prepare,
    Start(Arc<Session>),
    Stop,
    Abort,
}

/// Reply to one coordination command.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeReply {
    Accepted(NodeState),
    Rejected(String),
}

/// Unsolicited status from a node to its broker.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeStatus {
    StateChanged {
        node_id: String,
        state: NodeState,
    },
    /// The node finished publishing a stream; subscribers past this
    /// point only see the drain.
    EndOfStream {
        node_id: String,
        stream_id: String,
    },
    Fault {
        node_id: String,
        message: String,
        fatal: bool,
    },
}

type CommandEnvelope = (NodeCommand, oneshot::Sender<NodeReply>);

/// Node side of the coordination channel.
pub struct NodeEndpoint {
    pub cmd_rx: mpsc::Receiver<CommandEnvelope>,
    pub status_tx: mpsc::Sender<NodeStatus>,
}

/// Broker side of the coordination channel. The broker owns the node
/// task; the node only ever holds this channel, never the broker.
pub struct NodeHandle {
    pub node_id: String,
    pub role: NodeRole,
    cmd_tx: mpsc::Sender<CommandEnvelope>,
    join: Option<JoinHandle<()>>,
}

impl NodeHandle {
    /// Sends one command and awaits the reply under the coordination
    /// timeout.
    pub async fn request(&self, cmd: NodeCommand) -> Result<NodeReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send((cmd, reply_tx))
            .await
            .map_err(|_| HermesError::Runtime(format!("node {} is gone", self.node_id)))?;
        match tokio::time::timeout(COORDINATION_TIMEOUT, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(HermesError::Runtime(format!(
                "node {} dropped its reply channel",
                self.node_id
            ))),
            Err(_) => Err(HermesError::Runtime(format!(
                "node {} did not reply within {:?}",
                self.node_id, COORDINATION_TIMEOUT
            ))),
        }
    }

    pub fn attach(&mut self, join: JoinHandle<()>) {
        self.join = Some(join);
    }

    /// Forced teardown past the drain deadline.
    pub fn force_stop(&mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }

    pub async fn join(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

/// Creates the paired coordination endpoints for one node.
pub fn coordination_channel(
    node_id: impl Into<String>,
    role: NodeRole,
    status_tx: mpsc::Sender<NodeStatus>,
) -> (NodeHandle, NodeEndpoint) {
    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    (
        NodeHandle {
            node_id: node_id.into(),
            role,
            cmd_tx,
            join: None,
        },
        NodeEndpoint { cmd_rx, status_tx },
    )
}

/// Role-specific behavior beneath the shared lifecycle runner. The
/// runner calls these in lifecycle order; heavy work happens on worker
/// tasks the implementation spawns, so the coordination reply path stays
/// responsive.
#[async_trait]
pub trait RoleWorker: Send {
    fn node_id(&self) -> &str;

    /// INIT work: acquire the external device.
    async fn init(&mut self) -> anyhow::Result<()>;

    /// PREPARE work: open the outbound data path, run the self-test.
    async fn prepare(&mut self) -> anyhow::Result<()>;

    /// START work: launch the production or ingestion loop and return.
    async fn start(&mut self, session: Arc<Session>) -> anyhow::Result<()>;

    /// STOP work: stop producing new data, let queues empty, wait for
    /// the worker loops.
    async fn drain(&mut self) -> anyhow::Result<()>;

    /// ABORT work: immediate teardown, nothing flushed.
    async fn abort(&mut self);
}
