use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broker lifecycle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerPhase {
    Boot,
    Discover,
    Sync,
    Ready,
    Run,
    Drain,
    Stop,
    Failed,
}

/// Inputs that drive the broker machine: peer messages on the control
/// plane and readiness signals from locally owned nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerEvent {
    /// Local sockets bound, proxy up, nodes instantiated.
    BootCompleted,
    /// Every configured peer announced itself.
    QuorumReached,
    /// Clock elected and acknowledged by every peer.
    SyncCompleted,
    /// Every local node reports READY and every peer sent ALL_READY.
    AllReady,
    /// Operator stop, duration expiry, peer DRAIN, or a fatal fault.
    DrainRequested,
    /// Final flush finished or deadline forced it.
    DrainCompleted,
    /// Unrecoverable failure in the current phase.
    Fault,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no transition from {phase:?} on {event:?}")]
pub struct InvalidTransition {
    pub phase: BrokerPhase,
    pub event: BrokerEvent,
}

impl BrokerPhase {
    /// Total transition function. Undefined pairs are programming
    /// errors: loud in development, the ERROR path in production.
    pub fn transition(self, event: BrokerEvent) -> Result<BrokerPhase, InvalidTransition> {
        use BrokerEvent::*;
        use BrokerPhase::*;

        let next = match (self, event) {
            (Boot, BootCompleted) => Discover,
            (Discover, QuorumReached) => Sync,
            (Sync, SyncCompleted) => Ready,
            (Ready, AllReady) => Run,
            (Run, DrainRequested) => Drain,
            // Faults before RUN fail the session outright; from RUN on
            // they go through the coordinated drain.
            (Boot, Fault) | (Discover, Fault) | (Sync, Fault) | (Ready, Fault) => Failed,
            (Run, Fault) => Drain,
            (Drain, DrainCompleted) => Stop,
            (Drain, Fault) => Stop,
            // A second drain request while draining is absorbed.
            (Drain, DrainRequested) => Drain,
            (phase, event) => {
                debug_assert!(false, "invalid broker transition {:?} on {:?}", phase, event);
                return Err(InvalidTransition { phase, event });
            }
        };
        Ok(next)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BrokerPhase::Stop | BrokerPhase::Failed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            BrokerPhase::Boot => "boot",
            BrokerPhase::Discover => "discover",
            BrokerPhase::Sync => "sync",
            BrokerPhase::Ready => "ready",
            BrokerPhase::Run => "run",
            BrokerPhase::Drain => "drain",
            BrokerPhase::Stop => "stop",
            BrokerPhase::Failed => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_reaches_stop() {
        let mut phase = BrokerPhase::Boot;
        for event in [
            BrokerEvent::BootCompleted,
            BrokerEvent::QuorumReached,
            BrokerEvent::SyncCompleted,
            BrokerEvent::AllReady,
            BrokerEvent::DrainRequested,
            BrokerEvent::DrainCompleted,
        ] {
            phase = phase.transition(event).unwrap();
        }
        assert_eq!(phase, BrokerPhase::Stop);
        assert!(phase.is_terminal());
    }

    #[test]
    fn pre_run_fault_fails_session() {
        assert_eq!(
            BrokerPhase::Sync.transition(BrokerEvent::Fault).unwrap(),
            BrokerPhase::Failed
        );
        assert_eq!(
            BrokerPhase::Discover.transition(BrokerEvent::Fault).unwrap(),
            BrokerPhase::Failed
        );
    }

    #[test]
    fn run_fault_goes_through_drain() {
        assert_eq!(
            BrokerPhase::Run.transition(BrokerEvent::Fault).unwrap(),
            BrokerPhase::Drain
        );
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn undefined_pair_is_rejected() {
        assert!(BrokerPhase::Boot.transition(BrokerEvent::AllReady).is_err());
    }
}
