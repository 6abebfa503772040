pub mod link;
pub mod pubsub;
pub mod wire;

pub use link::{spawn_control_listener, spawn_data_listener, ControlEvent, ControlLink, DataLink};
pub use pubsub::{BusMessage, BusSubscription, LocalBus};
pub use wire::{BrokerDescriptor, ControlKind, ControlMessage};
