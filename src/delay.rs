use std::sync::Arc;

use crate::config::DelayEstimatorConfig;

/// Metadata visible to the estimator for one sample at ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleMeta {
    pub device_ts_ns: Option<i64>,
    pub payload_len: usize,
}

/// Per-stream propagation-delay correction applied on the producer worker
/// at ingress. Implementations must be deterministic and side-effect
/// free: the same `(stream_id, meta)` pair always yields the same
/// correction.
pub trait DelayEstimator: Send + Sync {
    fn delay_ns(&self, stream_id: &str, meta: &SampleMeta) -> i64;
}

/// Default estimator, no correction.
pub struct ZeroDelay;

impl DelayEstimator for ZeroDelay {
    fn delay_ns(&self, _stream_id: &str, _meta: &SampleMeta) -> i64 {
        0
    }
}

/// Constant transport latency, configured per stream.
pub struct ConstantDelay {
    delay_ns: i64,
}

impl ConstantDelay {
    pub fn new(delay_ns: i64) -> Self {
        Self { delay_ns }
    }
}

impl DelayEstimator for ConstantDelay {
    fn delay_ns(&self, _stream_id: &str, _meta: &SampleMeta) -> i64 {
        self.delay_ns
    }
}

/// Resolves the configured driver selection into an estimator instance.
pub fn build_estimator(config: Option<&DelayEstimatorConfig>) -> Arc<dyn DelayEstimator> {
    match config {
        None | Some(DelayEstimatorConfig::Zero) => Arc::new(ZeroDelay),
        Some(DelayEstimatorConfig::Constant { delay_ns }) => Arc::new(ConstantDelay::new(*delay_ns)),
    }
}
