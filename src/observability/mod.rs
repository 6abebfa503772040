pub mod collector;
pub mod metrics;

pub use collector::{CountersSnapshot, MetricsCollector};
pub use metrics::StreamCounters;
