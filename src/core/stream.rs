use serde::{Deserialize, Serialize};

/// Shape of one tabular sample row. Video streams carry opaque frames and
/// leave the shape empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Row shape, e.g. `[3]` for an accelerometer triple or `[2, 3]` for
    /// a burst matrix. Empty for opaque frames.
    pub shape: Vec<usize>,
}

impl Schema {
    pub fn tabular(shape: Vec<usize>) -> Self {
        Self { shape }
    }

    pub fn opaque() -> Self {
        Self { shape: Vec::new() }
    }

    /// Number of scalar elements in one row.
    pub fn row_len(&self) -> usize {
        if self.shape.is_empty() {
            0
        } else {
            self.shape.iter().product()
        }
    }
}

/// A typed channel of samples from one device under one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub stream_id: String,
    pub device_id: String,
    pub node_id: String,
    pub schema: Schema,
    pub nominal_rate_hz: f64,
    /// Burst streams deliver N samples per wake under a single timestamp.
    #[serde(default)]
    pub is_burst: bool,
    #[serde(default)]
    pub is_video: bool,
    #[serde(default)]
    pub channel_names: Vec<String>,
}

impl StreamSpec {
    /// Topic the stream's samples are published under. Subscribers match
    /// by prefix, so `node_id` alone selects every stream of a node.
    pub fn topic(&self) -> String {
        format!("{}.{}", self.node_id, self.stream_id)
    }

    /// Globally unique key once prefixed by the owning broker.
    pub fn scoped_id(&self, broker_id: &str) -> String {
        format!("{}/{}/{}", broker_id, self.node_id, self.stream_id)
    }
}

/// Returns true when `topic` falls under the subscription prefix.
pub fn topic_matches(prefix: &str, topic: &str) -> bool {
    topic == prefix || (topic.starts_with(prefix) && topic.as_bytes().get(prefix.len()) == Some(&b'.'))
}
