pub mod sim;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::core::{Payload, StreamSpec};
use crate::keyboard::KeyboardHub;

/// One acquisition from a source: the payloads share a single device
/// wake, so a burst source returns several under one timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub stream_id: String,
    pub device_ts_ns: Option<i64>,
    pub payloads: Vec<Payload>,
}

impl SensorReading {
    pub fn single(stream_id: impl Into<String>, device_ts_ns: Option<i64>, payload: Payload) -> Self {
        Self {
            stream_id: stream_id.into(),
            device_ts_ns,
            payloads: vec![payload],
        }
    }
}

/// A device instance owned by exactly one producer node. Vendor SDK
/// bindings implement this seam outside the core; the crate ships the
/// simulated sources below.
#[async_trait]
pub trait SensorSource: Send {
    /// Acquire the external device. Called once in INIT.
    async fn open(&mut self) -> Result<()>;

    /// Short self-test run on PREPARE, after the data socket is up.
    async fn self_test(&mut self) -> Result<()> {
        Ok(())
    }

    /// Begin producing. Called on START.
    async fn start(&mut self) -> Result<()>;

    /// Next acquisition, or `None` once the source is exhausted or was
    /// stopped. The production worker is the only caller.
    async fn read(&mut self) -> Result<Option<SensorReading>>;

    /// Blocking device round-trip for the transmission-delay probe.
    /// Sources without a measurable path keep the default.
    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    /// Stop acquiring new data. Already-captured data may still be read.
    async fn stop(&mut self) -> Result<()>;

    /// Release the device.
    async fn close(&mut self) -> Result<()>;
}

/// Ambient handles a driver may need when instantiating a source.
#[derive(Clone)]
pub struct DriverContext {
    pub keyboard: Arc<KeyboardHub>,
}

/// Factory for sources of one driver family.
pub trait SensorDriver: Send + Sync {
    fn driver_id(&self) -> &str;

    fn create_source(
        &self,
        streams: &[StreamSpec],
        params: &Value,
        ctx: &DriverContext,
    ) -> Result<Box<dyn SensorSource>>;
}

/// Registry of available drivers, keyed by the `driver` field of a node
/// spec.
pub struct DriverRegistry {
    drivers: HashMap<String, Box<dyn SensorDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    /// Registry preloaded with the built-in simulated drivers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(sim::SimImuDriver));
        registry.register(Box::new(sim::SimCameraDriver));
        registry.register(Box::new(sim::SimBurstDriver));
        registry.register(Box::new(sim::LatencyProbeDriver));
        registry.register(Box::new(sim::NotesDriver));
        registry
    }

    pub fn register(&mut self, driver: Box<dyn SensorDriver>) {
        self.drivers.insert(driver.driver_id().to_string(), driver);
    }

    pub fn create_source(
        &self,
        driver_id: &str,
        streams: &[StreamSpec],
        params: &Value,
        ctx: &DriverContext,
    ) -> Result<Box<dyn SensorSource>> {
        self.drivers
            .get(driver_id)
            .ok_or_else(|| anyhow!("unknown driver: {}", driver_id))?
            .create_source(streams, params, ctx)
    }

    pub fn list_drivers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.drivers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
