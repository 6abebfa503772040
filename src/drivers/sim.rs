use std::f64::consts::PI;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::{interval, Interval, MissedTickBehavior};

use crate::core::{Payload, StreamSpec};
use crate::keyboard::KeyEvent;

use super::{DriverContext, SensorDriver, SensorReading, SensorSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceState {
    Unopened,
    Opened,
    Running,
    Stopped,
    Closed,
}

fn paced_interval(rate_hz: f64) -> Interval {
    let mut ticker = interval(Duration::from_secs_f64(1.0 / rate_hz));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
    ticker
}

/// Fixed-rate inertial source producing a deterministic sinusoid per
/// channel. Stands in for an IMU suit SDK.
pub struct SimImuSource {
    spec: StreamSpec,
    state: SourceState,
    ticker: Option<Interval>,
    sample_no: u64,
    fail_open: bool,
}

#[async_trait]
impl SensorSource for SimImuSource {
    async fn open(&mut self) -> Result<()> {
        if self.state != SourceState::Unopened {
            bail!("cannot open source in state {:?}", self.state);
        }
        if self.fail_open {
            bail!("simulated device refused to open");
        }
        self.state = SourceState::Opened;
        Ok(())
    }

    async fn self_test(&mut self) -> Result<()> {
        if self.state != SourceState::Opened {
            bail!("self-test requires an opened source");
        }
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        if self.state != SourceState::Opened && self.state != SourceState::Stopped {
            bail!("cannot start source in state {:?}", self.state);
        }
        self.ticker = Some(paced_interval(self.spec.nominal_rate_hz));
        self.state = SourceState::Running;
        Ok(())
    }

    async fn read(&mut self) -> Result<Option<SensorReading>> {
        if self.state != SourceState::Running {
            return Ok(None);
        }
        let ticker = self.ticker.as_mut().ok_or_else(|| anyhow!("source not started"))?;
        ticker.tick().await;

        let row_len = self.spec.schema.row_len().max(1);
        let phase = self.sample_no as f64 / self.spec.nominal_rate_hz;
        let values: Vec<f64> = (0..row_len)
            .map(|ch| (2.0 * PI * (ch as f64 + 1.0) * phase).sin())
            .collect();
        let device_ts = (self.sample_no as f64 * 1e9 / self.spec.nominal_rate_hz) as i64;
        self.sample_no += 1;
        Ok(Some(SensorReading::single(
            self.spec.stream_id.clone(),
            Some(device_ts),
            Payload::Tabular(values),
        )))
    }

    async fn stop(&mut self) -> Result<()> {
        if self.state == SourceState::Running {
            self.state = SourceState::Stopped;
            self.ticker = None;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.stop().await?;
        self.state = SourceState::Closed;
        Ok(())
    }
}

pub struct SimImuDriver;

impl SensorDriver for SimImuDriver {
    fn driver_id(&self) -> &str {
        "sim-imu"
    }

    fn create_source(
        &self,
        streams: &[StreamSpec],
        params: &Value,
        _ctx: &DriverContext,
    ) -> Result<Box<dyn SensorSource>> {
        let spec = streams
            .first()
            .ok_or_else(|| anyhow!("sim-imu needs one stream"))?
            .clone();
        Ok(Box::new(SimImuSource {
            spec,
            state: SourceState::Unopened,
            ticker: None,
            sample_no: 0,
            fail_open: params["fail_open"].as_bool().unwrap_or(false),
        }))
    }
}

/// Fixed-FPS opaque-frame source. Stands in for a camera SDK; frame
/// content is a deterministic byte pattern of the configured size.
pub struct SimCameraSource {
    spec: StreamSpec,
    frame_bytes: usize,
    state: SourceState,
    ticker: Option<Interval>,
    frame_no: u64,
}

#[async_trait]
impl SensorSource for SimCameraSource {
    async fn open(&mut self) -> Result<()> {
        if self.state != SourceState::Unopened {
            bail!("cannot open source in state {:?}", self.state);
        }
        self.state = SourceState::Opened;
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        if self.state != SourceState::Opened && self.state != SourceState::Stopped {
            bail!("cannot start source in state {:?}", self.state);
        }
        self.ticker = Some(paced_interval(self.spec.nominal_rate_hz));
        self.state = SourceState::Running;
        Ok(())
    }

    async fn read(&mut self) -> Result<Option<SensorReading>> {
        if self.state != SourceState::Running {
            return Ok(None);
        }
        let ticker = self.ticker.as_mut().ok_or_else(|| anyhow!("source not started"))?;
        ticker.tick().await;

        let fill = (self.frame_no % 251) as u8;
        let frame = vec![fill; self.frame_bytes];
        let device_pts = (self.frame_no as f64 * 1e9 / self.spec.nominal_rate_hz) as i64;
        self.frame_no += 1;
        Ok(Some(SensorReading::single(
            self.spec.stream_id.clone(),
            Some(device_pts),
            Payload::Frame(frame),
        )))
    }

    async fn stop(&mut self) -> Result<()> {
        if self.state == SourceState::Running {
            self.state = SourceState::Stopped;
            self.ticker = None;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.stop().await?;
        self.state = SourceState::Closed;
        Ok(())
    }
}

pub struct SimCameraDriver;

impl SensorDriver for SimCameraDriver {
    fn driver_id(&self) -> &str {
        "sim-camera"
    }

    fn create_source(
        &self,
        streams: &[StreamSpec],
        params: &Value,
        _ctx: &DriverContext,
    ) -> Result<Box<dyn SensorSource>> {
        let spec = streams
            .first()
            .ok_or_else(|| anyhow!("sim-camera needs one stream"))?
            .clone();
        Ok(Box::new(SimCameraSource {
            spec,
            frame_bytes: params["frame_bytes"].as_u64().unwrap_or(4096) as usize,
            state: SourceState::Unopened,
            ticker: None,
            frame_no: 0,
        }))
    }
}

/// Burst-mode source: each wake delivers `burst_len` rows under one
/// device timestamp, the way packet-batched sensors report.
pub struct SimBurstSource {
    spec: StreamSpec,
    burst_len: usize,
    state: SourceState,
    ticker: Option<Interval>,
    wake_no: u64,
}

#[async_trait]
impl SensorSource for SimBurstSource {
    async fn open(&mut self) -> Result<()> {
        if self.state != SourceState::Unopened {
            bail!("cannot open source in state {:?}", self.state);
        }
        self.state = SourceState::Opened;
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        if self.state != SourceState::Opened && self.state != SourceState::Stopped {
            bail!("cannot start source in state {:?}", self.state);
        }
        // Wake rate is the nominal rate divided over the burst.
        let wake_hz = self.spec.nominal_rate_hz / self.burst_len as f64;
        self.ticker = Some(paced_interval(wake_hz));
        self.state = SourceState::Running;
        Ok(())
    }

    async fn read(&mut self) -> Result<Option<SensorReading>> {
        if self.state != SourceState::Running {
            return Ok(None);
        }
        let ticker = self.ticker.as_mut().ok_or_else(|| anyhow!("source not started"))?;
        ticker.tick().await;

        let row_len = self.spec.schema.row_len().max(1);
        let payloads: Vec<Payload> = (0..self.burst_len)
            .map(|i| {
                let t = (self.wake_no * self.burst_len as u64 + i as u64) as f64;
                Payload::Tabular((0..row_len).map(|ch| t + ch as f64 * 0.25).collect())
            })
            .collect();
        let device_ts = (self.wake_no as f64 * self.burst_len as f64 * 1e9 / self.spec.nominal_rate_hz) as i64;
        self.wake_no += 1;
        Ok(Some(SensorReading {
            stream_id: self.spec.stream_id.clone(),
            device_ts_ns: Some(device_ts),
            payloads,
        }))
    }

    async fn stop(&mut self) -> Result<()> {
        if self.state == SourceState::Running {
            self.state = SourceState::Stopped;
            self.ticker = None;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.stop().await?;
        self.state = SourceState::Closed;
        Ok(())
    }
}

pub struct SimBurstDriver;

impl SensorDriver for SimBurstDriver {
    fn driver_id(&self) -> &str {
        "sim-burst"
    }

    fn create_source(
        &self,
        streams: &[StreamSpec],
        params: &Value,
        _ctx: &DriverContext,
    ) -> Result<Box<dyn SensorSource>> {
        let spec = streams
            .first()
            .ok_or_else(|| anyhow!("sim-burst needs one stream"))?
            .clone();
        if !spec.is_burst {
            bail!("sim-burst requires a burst stream");
        }
        Ok(Box::new(SimBurstSource {
            spec,
            burst_len: params["burst_len"].as_u64().unwrap_or(8) as usize,
            state: SourceState::Unopened,
            ticker: None,
            wake_no: 0,
        }))
    }
}

/// Source for the latency test harness. Rate and payload size come from
/// the harness environment variables when present, config otherwise.
pub struct LatencyProbeSource {
    spec: StreamSpec,
    rate_hz: f64,
    num_bytes: usize,
    state: SourceState,
    ticker: Option<Interval>,
    seq: u64,
}

#[async_trait]
impl SensorSource for LatencyProbeSource {
    async fn open(&mut self) -> Result<()> {
        if self.state != SourceState::Unopened {
            bail!("cannot open source in state {:?}", self.state);
        }
        if let Ok(rate) = std::env::var("HERMES_EXP_RATE") {
            self.rate_hz = rate.parse().map_err(|_| anyhow!("bad HERMES_EXP_RATE: {}", rate))?;
        }
        if let Ok(bytes) = std::env::var("HERMES_EXP_NUM_BYTES") {
            self.num_bytes = bytes
                .parse()
                .map_err(|_| anyhow!("bad HERMES_EXP_NUM_BYTES: {}", bytes))?;
        }
        self.state = SourceState::Opened;
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        if self.state != SourceState::Opened && self.state != SourceState::Stopped {
            bail!("cannot start source in state {:?}", self.state);
        }
        self.ticker = Some(paced_interval(self.rate_hz));
        self.state = SourceState::Running;
        Ok(())
    }

    async fn read(&mut self) -> Result<Option<SensorReading>> {
        if self.state != SourceState::Running {
            return Ok(None);
        }
        let ticker = self.ticker.as_mut().ok_or_else(|| anyhow!("source not started"))?;
        ticker.tick().await;
        let frame = vec![(self.seq % 251) as u8; self.num_bytes];
        self.seq += 1;
        Ok(Some(SensorReading::single(
            self.spec.stream_id.clone(),
            None,
            Payload::Frame(frame),
        )))
    }

    async fn stop(&mut self) -> Result<()> {
        if self.state == SourceState::Running {
            self.state = SourceState::Stopped;
            self.ticker = None;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.stop().await?;
        self.state = SourceState::Closed;
        Ok(())
    }
}

pub struct LatencyProbeDriver;

impl SensorDriver for LatencyProbeDriver {
    fn driver_id(&self) -> &str {
        "latency-probe"
    }

    fn create_source(
        &self,
        streams: &[StreamSpec],
        params: &Value,
        _ctx: &DriverContext,
    ) -> Result<Box<dyn SensorSource>> {
        let spec = streams
            .first()
            .ok_or_else(|| anyhow!("latency-probe needs one stream"))?
            .clone();
        Ok(Box::new(LatencyProbeSource {
            rate_hz: params["rate_hz"].as_f64().unwrap_or(spec.nominal_rate_hz),
            num_bytes: params["num_bytes"].as_u64().unwrap_or(64) as usize,
            spec,
            state: SourceState::Unopened,
            ticker: None,
            seq: 0,
        }))
    }
}

/// Operator-notes source: each line the operator types becomes one
/// timestamped sample, so annotations land on the session timeline next
/// to the sensor data.
pub struct NotesSource {
    spec: StreamSpec,
    keys: broadcast::Receiver<KeyEvent>,
    state: SourceState,
}

#[async_trait]
impl SensorSource for NotesSource {
    async fn open(&mut self) -> Result<()> {
        if self.state != SourceState::Unopened {
            bail!("cannot open source in state {:?}", self.state);
        }
        self.state = SourceState::Opened;
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        if self.state != SourceState::Opened && self.state != SourceState::Stopped {
            bail!("cannot start source in state {:?}", self.state);
        }
        self.state = SourceState::Running;
        Ok(())
    }

    async fn read(&mut self) -> Result<Option<SensorReading>> {
        loop {
            if self.state != SourceState::Running {
                return Ok(None);
            }
            match self.keys.recv().await {
                Ok(KeyEvent::Line(line)) => {
                    return Ok(Some(SensorReading::single(
                        self.spec.stream_id.clone(),
                        None,
                        Payload::Frame(line.into_bytes()),
                    )));
                }
                Ok(KeyEvent::Shutdown) => return Ok(None),
                // Missed keystrokes only mean the note stream pauses.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }

    async fn stop(&mut self) -> Result<()> {
        if self.state == SourceState::Running {
            self.state = SourceState::Stopped;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.stop().await?;
        self.state = SourceState::Closed;
        Ok(())
    }
}

pub struct NotesDriver;

impl SensorDriver for NotesDriver {
    fn driver_id(&self) -> &str {
        "notes"
    }

    fn create_source(
        &self,
        streams: &[StreamSpec],
        _params: &Value,
        ctx: &DriverContext,
    ) -> Result<Box<dyn SensorSource>> {
        let spec = streams
            .first()
            .ok_or_else(|| anyhow!("notes needs one stream"))?
            .clone();
        Ok(Box::new(NotesSource {
            spec,
            keys: ctx.keyboard.subscribe(),
            state: SourceState::Unopened,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Schema;
    use crate::keyboard::KeyboardHub;
    use std::sync::Arc;

    fn imu_spec(rate_hz: f64) -> StreamSpec {
        StreamSpec {
            stream_id: "imu-acc".into(),
            device_id: "sim0".into(),
            node_id: "imu".into(),
            schema: Schema::tabular(vec![3]),
            nominal_rate_hz: rate_hz,
            is_burst: false,
            is_video: false,
            channel_names: vec!["x".into(), "y".into(), "z".into()],
        }
    }

    fn ctx() -> DriverContext {
        DriverContext {
            keyboard: Arc::new(KeyboardHub::new(8)),
        }
    }

    #[tokio::test]
    async fn sim_imu_produces_rows_of_schema_width() {
        let registry = super::super::DriverRegistry::with_builtins();
        let mut source = registry
            .create_source("sim-imu", &[imu_spec(500.0)], &serde_json::json!({}), &ctx())
            .unwrap();
        source.open().await.unwrap();
        source.self_test().await.unwrap();
        source.start().await.unwrap();
        let reading = source.read().await.unwrap().unwrap();
        assert_eq!(reading.payloads.len(), 1);
        match &reading.payloads[0] {
            Payload::Tabular(row) => assert_eq!(row.len(), 3),
            other => panic!("unexpected payload {:?}", other),
        }
        source.close().await.unwrap();
    }

    #[tokio::test]
    async fn failed_open_is_surfaced() {
        let registry = super::super::DriverRegistry::with_builtins();
        let mut source = registry
            .create_source(
                "sim-imu",
                &[imu_spec(100.0)],
                &serde_json::json!({"fail_open": true}),
                &ctx(),
            )
            .unwrap();
        assert!(source.open().await.is_err());
    }

    #[tokio::test]
    async fn burst_source_emits_whole_bursts() {
        let registry = super::super::DriverRegistry::with_builtins();
        let mut spec = imu_spec(400.0);
        spec.is_burst = true;
        let mut source = registry
            .create_source("sim-burst", &[spec], &serde_json::json!({"burst_len": 4}), &ctx())
            .unwrap();
        source.open().await.unwrap();
        source.start().await.unwrap();
        let reading = source.read().await.unwrap().unwrap();
        assert_eq!(reading.payloads.len(), 4);
        assert!(reading.device_ts_ns.is_some());
    }

    #[tokio::test]
    async fn latency_probe_honors_harness_environment() {
        std::env::set_var("HERMES_EXP_RATE", "250");
        std::env::set_var("HERMES_EXP_NUM_BYTES", "32");
        let registry = super::super::DriverRegistry::with_builtins();
        let mut spec = imu_spec(10.0);
        spec.stream_id = "probe".into();
        let mut source = registry
            .create_source("latency-probe", &[spec], &serde_json::json!({}), &ctx())
            .unwrap();
        source.open().await.unwrap();
        source.start().await.unwrap();
        let reading = source.read().await.unwrap().unwrap();
        match &reading.payloads[0] {
            Payload::Frame(bytes) => assert_eq!(bytes.len(), 32),
            other => panic!("unexpected payload {:?}", other),
        }
        std::env::remove_var("HERMES_EXP_RATE");
        std::env::remove_var("HERMES_EXP_NUM_BYTES");
    }

    #[tokio::test]
    async fn notes_source_turns_lines_into_samples() {
        let hub = Arc::new(KeyboardHub::new(8));
        let registry = super::super::DriverRegistry::with_builtins();
        let mut spec = imu_spec(1.0);
        spec.stream_id = "notes".into();
        spec.schema = Schema::opaque();
        let mut source = registry
            .create_source(
                "notes",
                &[spec],
                &serde_json::json!({}),
                &DriverContext { keyboard: Arc::clone(&hub) },
            )
            .unwrap();
        source.open().await.unwrap();
        source.start().await.unwrap();
        hub.post_line("subject stumbled");
        let reading = source.read().await.unwrap().unwrap();
        assert_eq!(
            reading.payloads[0],
            Payload::Frame(b"subject stumbled".to_vec())
        );
        hub.post_shutdown();
        assert!(source.read().await.unwrap().is_none());
    }
}
