use serde::{Deserialize, Serialize};

use super::stream::StreamSpec;

/// A single coordinated run, created once at RUN entry and immutable
/// thereafter. Workers receive snapshots, never shared mutable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub started_at_reference_ns: i64,
    pub participating_brokers: Vec<String>,
    pub streams: Vec<StreamSpec>,
}

impl Session {
    pub fn stream(&self, stream_id: &str) -> Option<&StreamSpec> {
        self.streams.iter().find(|s| s.stream_id == stream_id)
    }
}
