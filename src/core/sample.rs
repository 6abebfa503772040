use serde::{Deserialize, Serialize};

/// Payload of a single sample: either one fixed-shape tabular row or an
/// opaque binary frame (video/image).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Tabular(Vec<f64>),
    Frame(Vec<u8>),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Tabular(values) => values.len(),
            Payload::Frame(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_frame(&self) -> bool {
        matches!(self, Payload::Frame(_))
    }
}

/// A timestamped record on one stream. Immutable once committed to a ring
/// or handed to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub stream_id: String,
    /// Per-(publisher, stream) strictly monotonic counter.
    pub seq: u64,
    /// Ingress timestamp on the negotiated reference clock, already
    /// corrected by the stream's delay estimate.
    pub reference_ts_ns: i64,
    /// Opaque secondary timestamp from the device, carried through.
    pub device_ts_ns: Option<i64>,
    pub payload: Payload,
}

/// Envelope for one sample on the data plane: what crosses the wire
/// between brokers and what subscribers receive from the local bus.
/// The topic routes it, the per-publisher `seq` orders it.
#[derive(Debug, Clone, PartialEq)]
pub struct DataMessage {
    pub topic: String,
    pub publisher_id: String,
    pub seq: u64,
    pub reference_ts_ns: i64,
    pub device_ts_ns: Option<i64>,
    pub payload: Payload,
}

impl DataMessage {
    pub fn from_sample(topic: impl Into<String>, publisher_id: impl Into<String>, sample: &Sample) -> Self {
        Self {
            topic: topic.into(),
            publisher_id: publisher_id.into(),
            seq: sample.seq,
            reference_ts_ns: sample.reference_ts_ns,
            device_ts_ns: sample.device_ts_ns,
            payload: sample.payload.clone(),
        }
    }

    /// Reconstruct the sample view of this message for a subscriber that
    /// logs or processes it under the stream id encoded in the topic.
    pub fn to_sample(&self, stream_id: impl Into<String>) -> Sample {
        Sample {
            stream_id: stream_id.into(),
            seq: self.seq,
            reference_ts_ns: self.reference_ts_ns,
            device_ts_ns: self.device_ts_ns,
            payload: self.payload.clone(),
        }
    }
}
