use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HermesError, Result};

/// Topology entry for one peer broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub broker_id: String,
    /// TCP endpoint of the peer's control listener.
    pub control_addr: String,
    /// TCP endpoint of the peer's data listener.
    pub data_addr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Producer,
    Consumer,
    Pipeline,
}

/// Delay-estimator driver selection for one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum DelayEstimatorConfig {
    Zero,
    Constant { delay_ns: i64 },
}

/// Per-stream declaration inside a node spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub stream_id: String,
    #[serde(default)]
    pub device_id: String,
    pub rate_hz: f64,
    #[serde(default)]
    pub shape: Vec<usize>,
    #[serde(default)]
    pub channel_names: Vec<String>,
    #[serde(default)]
    pub is_burst: bool,
    #[serde(default)]
    pub is_video: bool,
    /// Delay correction driver for this stream; zero when omitted.
    #[serde(default)]
    pub delay_estimator: Option<DelayEstimatorConfig>,
}

/// Node inventory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    pub role: NodeRole,
    /// Driver id resolved against the driver registry, e.g. "sim-imu".
    #[serde(default)]
    pub driver: String,
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
    /// Topic prefixes a consumer or pipeline subscribes to.
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Optional period of the transmission-delay probe thread.
    #[serde(default)]
    pub delay_probe_period_s: Option<f64>,
}

fn default_flush_hz() -> f64 {
    2.0
}

fn default_high_water() -> f64 {
    0.75
}

fn default_ring_capacity() -> usize {
    4096
}

fn default_drain_deadline_ms() -> u64 {
    5_000
}

fn default_video_codec() -> String {
    "mjpeg".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub root_dir: PathBuf,
    #[serde(default = "default_flush_hz")]
    pub flush_hz: f64,
    /// Ring occupancy fraction above which flushers tighten their wake
    /// interval.
    #[serde(default = "default_high_water")]
    pub high_water: f64,
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    #[serde(default = "default_drain_deadline_ms")]
    pub drain_deadline_ms: u64,
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./hermes_data"),
            flush_hz: default_flush_hz(),
            high_water: default_high_water(),
            ring_capacity: default_ring_capacity(),
            drain_deadline_ms: default_drain_deadline_ms(),
            video_codec: default_video_codec(),
        }
    }
}

fn default_discover_timeout_ms() -> u64 {
    10_000
}

fn default_sync_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_discover_timeout_ms")]
    pub discover_timeout_ms: u64,
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            discover_timeout_ms: default_discover_timeout_ms(),
            sync_timeout_ms: default_sync_timeout_ms(),
        }
    }
}

/// Broker policy when a local node faults at INIT or mid-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeErrorPolicy {
    /// Fail the whole host session.
    #[default]
    FailHost,
    /// Continue degraded without the faulted node.
    Degrade,
}

/// The single configuration object the core is parameterized by. Flag
/// parsing and config-file schema loading live in the CLI collaborator;
/// the core only consumes the resolved object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HermesConfig {
    pub broker_id: String,
    /// TCP bind endpoint for the control listener.
    pub control_addr: String,
    /// TCP bind endpoint for the data listener.
    pub data_addr: String,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub clock_eligible: bool,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub on_node_error: NodeErrorPolicy,
    /// Optional session duration; drain starts when it elapses.
    #[serde(default)]
    pub duration_s: Option<f64>,
    /// Propagated verbatim into the session metadata.
    #[serde(default)]
    pub experiment: BTreeMap<String, String>,
}

impl HermesConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| HermesError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: HermesConfig = serde_json::from_str(&text)
            .map_err(|e| HermesError::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Topology and inventory consistency checks, run once at BOOT.
    pub fn validate(&self) -> Result<()> {
        if self.broker_id.is_empty() {
            return Err(HermesError::Config("broker_id must not be empty".into()));
        }

        let mut peer_ids = HashSet::new();
        for peer in &self.peers {
            if peer.broker_id == self.broker_id {
                return Err(HermesError::Config(format!(
                    "peer list contains own broker_id {:?}",
                    self.broker_id
                )));
            }
            if !peer_ids.insert(peer.broker_id.as_str()) {
                return Err(HermesError::Config(format!(
                    "duplicate peer broker_id {:?}",
                    peer.broker_id
                )));
            }
        }

        let mut node_ids = HashSet::new();
        let mut stream_ids = HashSet::new();
        for node in &self.nodes {
            if !node_ids.insert(node.node_id.as_str()) {
                return Err(HermesError::Config(format!(
                    "duplicate node_id {:?}",
                    node.node_id
                )));
            }
            match node.role {
                NodeRole::Producer => {
                    if node.streams.is_empty() {
                        return Err(HermesError::Config(format!(
                            "producer {:?} declares no output streams",
                            node.node_id
                        )));
                    }
                    if node.driver.is_empty() {
                        return Err(HermesError::Config(format!(
                            "producer {:?} declares no driver",
                            node.node_id
                        )));
                    }
                }
                NodeRole::Consumer => {
                    if node.topics.is_empty() {
                        return Err(HermesError::Config(format!(
                            "consumer {:?} subscribes to no topics",
                            node.node_id
                        )));
                    }
                }
                NodeRole::Pipeline => {
                    if node.topics.is_empty() || node.streams.is_empty() {
                        return Err(HermesError::Config(format!(
                            "pipeline {:?} needs both input topics and output streams",
                            node.node_id
                        )));
                    }
                }
            }
            for stream in &node.streams {
                if !stream_ids.insert(stream.stream_id.clone()) {
                    return Err(HermesError::Config(format!(
                        "duplicate stream_id {:?}",
                        stream.stream_id
                    )));
                }
                if stream.rate_hz <= 0.0 {
                    return Err(HermesError::Config(format!(
                        "stream {:?} has non-positive nominal rate",
                        stream.stream_id
                    )));
                }
            }
        }

        if self.storage.flush_hz <= 0.0 {
            return Err(HermesError::Config("storage.flush_hz must be positive".into()));
        }
        if !(0.0 < self.storage.high_water && self.storage.high_water <= 1.0) {
            return Err(HermesError::Config(
                "storage.high_water must be within (0, 1]".into(),
            ));
        }
        if self.storage.ring_capacity == 0 {
            return Err(HermesError::Config("storage.ring_capacity must be positive".into()));
        }

        Ok(())
    }

    /// Digest of the canonical JSON form, recorded in session metadata so
    /// recordings can be traced back to the exact configuration.
    pub fn digest(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        blake3::hash(canonical.as_bytes()).to_hex().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> HermesConfig {
        serde_json::from_value(serde_json::json!({
            "broker_id": "a",
            "control_addr": "127.0.0.1:7101",
            "data_addr": "127.0.0.1:7102",
            "nodes": [{
                "node_id": "imu",
                "role": "producer",
                "driver": "sim-imu",
                "streams": [{"stream_id": "imu-acc", "rate_hz": 100.0, "shape": [3]}]
            }]
        }))
        .unwrap()
    }

    #[test]
    fn minimal_config_validates() {
        assert!(minimal().validate().is_ok());
    }

    #[test]
    fn duplicate_node_id_rejected() {
        let mut config = minimal();
        config.nodes.push(config.nodes[0].clone());
        assert!(matches!(config.validate(), Err(HermesError::Config(_))));
    }

    #[test]
    fn producer_without_streams_rejected() {
        let mut config = minimal();
        config.nodes[0].streams.clear();
        assert!(matches!(config.validate(), Err(HermesError::Config(_))));
    }

    #[test]
    fn delay_estimator_is_selected_per_stream() {
        let config: HermesConfig = serde_json::from_value(serde_json::json!({
            "broker_id": "a",
            "control_addr": "127.0.0.1:7101",
            "data_addr": "127.0.0.1:7102",
            "nodes": [{
                "node_id": "suit",
                "role": "producer",
                "driver": "sim-imu",
                "streams": [
                    {
                        "stream_id": "acc",
                        "rate_hz": 100.0,
                        "delay_estimator": {"driver": "constant", "delay_ns": 250000}
                    },
                    {"stream_id": "gyr", "rate_hz": 100.0}
                ]
            }]
        }))
        .unwrap();
        let streams = &config.nodes[0].streams;
        assert_eq!(
            streams[0].delay_estimator,
            Some(DelayEstimatorConfig::Constant { delay_ns: 250_000 })
        );
        assert_eq!(streams[1].delay_estimator, None);
    }

    #[test]
    fn digest_is_stable_and_sensitive() {
        let config = minimal();
        assert_eq!(config.digest(), config.digest());
        let mut other = config.clone();
        other.clock_eligible = true;
        assert_ne!(config.digest(), other.digest());
    }
}
