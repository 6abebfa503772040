pub mod broker;
pub mod config;
pub mod core;
pub mod delay;
pub mod drivers;
pub mod error;
pub mod keyboard;
pub mod node;
pub mod observability;
pub mod storage;
pub mod supervisor;
pub mod transport;

pub use broker::{Broker, BrokerPhase, RunOutcome, RunSummary};
pub use config::HermesConfig;
pub use core::{DataMessage, Payload, ReferenceClock, Sample, Schema, Session, StreamSpec};
pub use error::{exit_code, HermesError, Result};
pub use supervisor::Host;
