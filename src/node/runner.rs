use tracing::{info, warn};

use super::{NodeCommand, NodeEndpoint, NodeReply, NodeState, NodeStatus, RoleWorker};

/// Drives one role worker through the node lifecycle in response to
/// coordination commands, keeping the reply path responsive and every
/// transition checked against the state machine.
pub struct ManagedNode {
    worker: Box<dyn RoleWorker>,
    state: NodeState,
}

impl ManagedNode {
    pub fn new(worker: Box<dyn RoleWorker>) -> Self {
        Self {
            worker,
            state: NodeState::Init,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Coordination loop; runs until the node reaches a terminal state
    /// or its broker goes away.
    pub async fn run(mut self, mut endpoint: NodeEndpoint) {
        let node_id = self.worker.node_id().to_string();

        // INIT work happens before the first command so a device that
        // cannot be acquired fails the node while the broker still sits
        // in BOOT.
        if let Err(e) = self.worker.init().await {
            warn!(node_id = %node_id, error = %e, "device acquisition failed");
            self.fail(&mut endpoint, &node_id, format!("init: {}", e)).await;
            return;
        }
        info!(node_id = %node_id, "node initialized");

        while let Some((cmd, reply)) = endpoint.cmd_rx.recv().await {
            match cmd {
                NodeCommand::Prepare => {
                    if !self.state.can_transition_to(NodeState::Ready) {
                        let _ = reply.send(self.reject("PREPARE"));
                        continue;
                    }
                    match self.worker.prepare().await {
                        Ok(()) => {
                            self.advance(&mut endpoint, &node_id, NodeState::Ready).await;
                            let _ = reply.send(NodeReply::Accepted(self.state));
                        }
                        Err(e) => {
                            let _ = reply.send(NodeReply::Rejected(e.to_string()));
                            self.fail(&mut endpoint, &node_id, format!("prepare: {}", e)).await;
                            return;
                        }
                    }
                }
                NodeCommand::Start(session) => {
                    if !self.state.can_transition_to(NodeState::Running) {
                        let _ = reply.send(self.reject("START"));
                        continue;
                    }
                    match self.worker.start(session).await {
                        Ok(()) => {
                            self.advance(&mut endpoint, &node_id, NodeState::Running).await;
                            let _ = reply.send(NodeReply::Accepted(self.state));
                        }
                        Err(e) => {
                            let _ = reply.send(NodeReply::Rejected(e.to_string()));
                            self.fail(&mut endpoint, &node_id, format!("start: {}", e)).await;
                            return;
                        }
                    }
                }
                NodeCommand::Stop => {
                    if !self.state.can_transition_to(NodeState::Draining) {
                        let _ = reply.send(self.reject("STOP"));
                        continue;
                    }
                    self.advance(&mut endpoint, &node_id, NodeState::Draining).await;
                    // Reply before the drain so the broker can fan the
                    // stop out to every node in parallel.
                    let _ = reply.send(NodeReply::Accepted(self.state));
                    match self.worker.drain().await {
                        Ok(()) => {
                            self.advance(&mut endpoint, &node_id, NodeState::Done).await;
                        }
                        Err(e) => {
                            self.fail(&mut endpoint, &node_id, format!("drain: {}", e)).await;
                        }
                    }
                    return;
                }
                NodeCommand::Abort => {
                    self.worker.abort().await;
                    self.state = NodeState::Error;
                    let _ = reply.send(NodeReply::Accepted(self.state));
                    let _ = endpoint
                        .status_tx
                        .send(NodeStatus::StateChanged {
                            node_id: node_id.clone(),
                            state: self.state,
                        })
                        .await;
                    return;
                }
            }
        }
        // Broker dropped the channel; tear down quietly.
        self.worker.abort().await;
    }

    fn reject(&self, cmd: &str) -> NodeReply {
        NodeReply::Rejected(format!("{} not valid in state {}", cmd, self.state.name()))
    }

    async fn advance(&mut self, endpoint: &mut NodeEndpoint, node_id: &str, target: NodeState) {
        self.state = target;
        let _ = endpoint
            .status_tx
            .send(NodeStatus::StateChanged {
                node_id: node_id.to_string(),
                state: self.state,
            })
            .await;
    }

    async fn fail(&mut self, endpoint: &mut NodeEndpoint, node_id: &str, message: String) {
        self.state = NodeState::Error;
        self.worker.abort().await;
        let _ = endpoint
            .status_tx
            .send(NodeStatus::Fault {
                node_id: node_id.to_string(),
                message,
                fatal: true,
            })
            .await;
        let _ = endpoint
            .status_tx
            .send(NodeStatus::StateChanged {
                node_id: node_id.to_string(),
                state: self.state,
            })
            .await;
    }
}
