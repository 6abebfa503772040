pub mod broker;
pub mod clock_sync;
pub mod proxy;
pub mod state;

pub use broker::{Broker, RunOutcome, RunSummary};
pub use clock_sync::elect_reference;
pub use state::{BrokerEvent, BrokerPhase, InvalidTransition};
