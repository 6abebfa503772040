use serde::{Deserialize, Serialize};

/// Lifecycle states common to every node role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Init,
    Ready,
    Running,
    Draining,
    Done,
    Error,
}

impl NodeState {
    /// Check if transition from current state to target state is valid.
    /// Undefined pairs are programming errors; the runner surfaces them
    /// as rejected commands.
    pub fn can_transition_to(&self, target: NodeState) -> bool {
        use NodeState::*;

        matches!(
            (self, target),
            (Init, Ready)
                | (Init, Error)
                | (Ready, Running)
                | (Ready, Error)
                | (Running, Draining)
                | (Running, Error)
                | (Draining, Done)
                | (Draining, Error)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Done | NodeState::Error)
    }

    pub fn name(&self) -> &'static str {
        match self {
            NodeState::Init => "init",
            NodeState::Ready => "ready",
            NodeState::Running => "running",
            NodeState::Draining => "draining",
            NodeState::Done => "done",
            NodeState::Error => "error",
        }
    }
}

impl Default for NodeState {
    fn default() -> Self {
        NodeState::Init
    }
}
