use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::LocalSet;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::core::{Payload, Sample, Session, StreamSpec};
use crate::error::{HermesError, Result};
use crate::observability::StreamCounters;

use super::container::{SessionContainer, SessionMetadata, VideoIndexRow};
use super::ring::{RingProbe, RingReader, RingWriter, SampleRing};
use super::video::SidecarWriter;

/// How many samples one claim moves at most. Keeps single flush writes
/// bounded so concurrent flushers interleave at the transaction
/// boundaries.
const FLUSH_BATCH: usize = 512;

/// Wake-interval divisor once a ring crosses its high-water mark.
const HURRY_FACTOR: u32 = 4;

/// Events surfaced from the storage subsystem to the owning broker.
#[derive(Debug)]
pub enum StorageEvent {
    /// A ring exceeded capacity. Fatal for the session.
    Overflow { stream_id: String },
}

/// Outcome of the final drain flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    /// Samples that were still unflushed when the drain deadline forced
    /// the engine down. Zero on a clean drain.
    pub unflushed: u64,
    pub deadline_hit: bool,
}

enum EngineCommand {
    Drain {
        deadline: Duration,
        reply: oneshot::Sender<DrainReport>,
    },
}

/// Write side handed to the node that owns the stream. Committing never
/// blocks: a full ring drops the sample, reports the overflow once, and
/// the caller treats the condition as fatal.
pub struct StreamSink {
    stream_id: String,
    writer: RingWriter,
    counters: Arc<StreamCounters>,
    overflow_tx: mpsc::UnboundedSender<StorageEvent>,
    overflowed: bool,
}

impl StreamSink {
    /// Commits one immutable sample. Returns false once the ring has
    /// overflowed.
    pub fn commit(&mut self, sample: Sample) -> bool {
        match self.writer.push(sample) {
            Ok(()) => true,
            Err(_) => {
                self.counters.record_dropped();
                if !self.overflowed {
                    self.overflowed = true;
                    let _ = self.overflow_tx.send(StorageEvent::Overflow {
                        stream_id: self.stream_id.clone(),
                    });
                }
                false
            }
        }
    }

    pub fn occupancy(&self) -> usize {
        self.writer.occupancy()
    }
}

struct FlusherEntry {
    spec: StreamSpec,
    reader: RingReader,
    probe: RingProbe,
    counters: Arc<StreamCounters>,
}

/// Burst-tolerant asynchronous storage for one host.
///
/// Streams register before the session starts; `start` moves the engine
/// onto a dedicated thread running a current-thread runtime where one
/// cooperative flush task per stream drains its ring into the session
/// container or video side-car.
pub struct StorageEngine {
    config: StorageConfig,
    host_id: String,
    broker_id: String,
    entries: Vec<FlusherEntry>,
    event_tx: mpsc::UnboundedSender<StorageEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<StorageEvent>>,
}

impl StorageEngine {
    pub fn new(config: StorageConfig, host_id: impl Into<String>, broker_id: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            config,
            host_id: host_id.into(),
            broker_id: broker_id.into(),
            entries: Vec::new(),
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Creates the stream's ring and keeps the reader half; the returned
    /// sink is the single writer.
    pub fn register_stream(&mut self, spec: StreamSpec, counters: Arc<StreamCounters>) -> StreamSink {
        let (writer, reader) = SampleRing::with_capacity(self.config.ring_capacity, self.config.high_water);
        let probe = reader.probe();
        let sink = StreamSink {
            stream_id: spec.stream_id.clone(),
            writer,
            counters: Arc::clone(&counters),
            overflow_tx: self.event_tx.clone(),
            overflowed: false,
        };
        self.entries.push(FlusherEntry {
            spec,
            reader,
            probe,
            counters,
        });
        sink
    }

    /// Overflow notifications for the broker loop. Callable once.
    pub fn take_events(&mut self) -> mpsc::UnboundedReceiver<StorageEvent> {
        self.event_rx.take().expect("storage events already taken")
    }

    /// Consumes the engine and starts the flush thread for `session`.
    pub fn start(self, session: Session, experiment: std::collections::BTreeMap<String, String>, config_digest: String) -> Result<StorageHandle> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let session_dir = self.config.root_dir.join(&session.session_id);
        let container_path = session_dir.join(format!("{}.sqlite", self.broker_id));
        let meta = SessionMetadata {
            session_id: session.session_id.clone(),
            started_at_reference_ns: session.started_at_reference_ns,
            host_id: self.host_id.clone(),
            broker_id: self.broker_id.clone(),
            config_digest,
            experiment,
        };

        let thread = std::thread::Builder::new()
            .name("hermes-storage".into())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| HermesError::Runtime(format!("storage runtime: {}", e)))?;
                let local = LocalSet::new();
                rt.block_on(local.run_until(engine_main(
                    self.config,
                    self.entries,
                    container_path,
                    session_dir,
                    meta,
                    cmd_rx,
                )))
            })
            .map_err(|e| HermesError::Runtime(format!("storage thread: {}", e)))?;

        Ok(StorageHandle {
            cmd_tx,
            thread: Some(thread),
        })
    }
}

/// Control handle to the running storage thread.
pub struct StorageHandle {
    cmd_tx: mpsc::UnboundedSender<EngineCommand>,
    thread: Option<std::thread::JoinHandle<Result<()>>>,
}

impl StorageHandle {
    /// Requests the final flush and waits for its report. Past the
    /// deadline the remaining data is discarded and counted.
    pub async fn drain(&self, deadline: Duration) -> DrainReport {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(EngineCommand::Drain { deadline, reply }).is_err() {
            return DrainReport {
                unflushed: 0,
                deadline_hit: false,
            };
        }
        rx.await.unwrap_or(DrainReport {
            unflushed: 0,
            deadline_hit: true,
        })
    }

    /// Joins the flush thread after drain.
    pub fn join(&mut self) -> Result<()> {
        if let Some(handle) = self.thread.take() {
            handle
                .join()
                .map_err(|_| HermesError::Runtime("storage thread panicked".into()))??;
        }
        Ok(())
    }
}

async fn engine_main(
    config: StorageConfig,
    entries: Vec<FlusherEntry>,
    container_path: PathBuf,
    session_dir: PathBuf,
    meta: SessionMetadata,
    mut cmd_rx: mpsc::UnboundedReceiver<EngineCommand>,
) -> Result<()> {
    let container = SessionContainer::create(&container_path)?;
    container.write_metadata(&meta)?;
    for entry in &entries {
        container.register_stream(&entry.spec)?;
    }
    let container = Rc::new(RefCell::new(container));
    info!(path = %container_path.display(), streams = entries.len(), "session container ready");

    let (drain_tx, drain_rx) = watch::channel(false);
    let mut probes: Vec<RingProbe> = Vec::with_capacity(entries.len());
    let mut flushers = Vec::with_capacity(entries.len());
    for entry in entries {
        probes.push(entry.probe.clone());
        let container = Rc::clone(&container);
        let drain_rx = drain_rx.clone();
        let codec = config.video_codec.clone();
        let session_dir = session_dir.clone();
        let base_interval = Duration::from_secs_f64(1.0 / config.flush_hz);
        flushers.push(tokio::task::spawn_local(async move {
            if entry.spec.is_video {
                flush_video_stream(entry, container, session_dir, codec, base_interval, drain_rx).await
            } else {
                flush_tabular_stream(entry, container, base_interval, drain_rx).await
            }
        }));
    }

    // Flushers run until the drain command arrives.
    let report = match cmd_rx.recv().await {
        Some(EngineCommand::Drain { deadline, reply }) => {
            let _ = drain_tx.send(true);
            let all_done = tokio::time::timeout(deadline, async {
                for flusher in &mut flushers {
                    let _ = flusher.await;
                }
            })
            .await
            .is_ok();
            if !all_done {
                for flusher in &flushers {
                    flusher.abort();
                }
            }
            let unflushed: u64 = probes.iter().map(|p| p.occupancy() as u64).sum();
            let report = DrainReport {
                unflushed,
                deadline_hit: !all_done,
            };
            if report.deadline_hit {
                warn!(unflushed = report.unflushed, "drain deadline hit, discarding remainder");
            } else {
                debug!("storage drained cleanly");
            }
            let _ = reply.send(report.clone());
            report
        }
        // Command channel dropped without a drain; flush what is there.
        None => {
            let _ = drain_tx.send(true);
            for flusher in &mut flushers {
                let _ = flusher.await;
            }
            DrainReport {
                unflushed: 0,
                deadline_hit: false,
            }
        }
    };

    if report.deadline_hit {
        Err(HermesError::DrainTimeout {
            unflushed: report.unflushed,
        })
    } else {
        Ok(())
    }
}

async fn flush_tabular_stream(
    entry: FlusherEntry,
    container: Rc<RefCell<SessionContainer>>,
    base_interval: Duration,
    mut drain_rx: watch::Receiver<bool>,
) {
    let mut interval = base_interval;
    loop {
        let draining = *drain_rx.borrow();
        if !draining {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = drain_rx.changed() => {}
            }
        }

        loop {
            let claimed = entry.reader.claim(FLUSH_BATCH);
            if claimed.is_empty() {
                break;
            }
            let count = claimed.len() as u64;
            if let Err(e) = container.borrow_mut().append_samples(&entry.spec, &claimed) {
                warn!(stream_id = %entry.spec.stream_id, error = %e, "tabular flush failed");
                entry.counters.record_transient_error();
                break;
            }
            entry.counters.record_flushed(count);
            // Yield between batches so sibling flushers make progress.
            tokio::task::yield_now().await;
        }

        if *drain_rx.borrow() && entry.reader.occupancy() == 0 {
            return;
        }
        interval = if entry.reader.is_above_high_water() {
            base_interval / HURRY_FACTOR
        } else {
            base_interval
        };
    }
}

async fn flush_video_stream(
    entry: FlusherEntry,
    container: Rc<RefCell<SessionContainer>>,
    session_dir: PathBuf,
    codec: String,
    base_interval: Duration,
    mut drain_rx: watch::Receiver<bool>,
) {
    let mut sidecar = match SidecarWriter::create(&session_dir, &entry.spec.stream_id, &codec).await {
        Ok(writer) => writer,
        Err(e) => {
            warn!(stream_id = %entry.spec.stream_id, error = %e, "cannot open video side-car");
            return;
        }
    };

    let mut interval = base_interval;
    loop {
        let draining = *drain_rx.borrow();
        if !draining {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = drain_rx.changed() => {}
            }
        }

        loop {
            let claimed = entry.reader.claim(FLUSH_BATCH);
            if claimed.is_empty() {
                break;
            }
            let mut index_rows = Vec::with_capacity(claimed.len());
            for sample in &claimed {
                let frame: &[u8] = match &sample.payload {
                    Payload::Frame(bytes) => bytes,
                    // Tabular data on a video stream is a producer bug;
                    // count it and move on.
                    Payload::Tabular(_) => {
                        entry.counters.record_transient_error();
                        continue;
                    }
                };
                match sidecar.append(frame, sample.reference_ts_ns, sample.device_ts_ns).await {
                    Ok(row) => index_rows.push(row),
                    Err(e) => {
                        warn!(stream_id = %entry.spec.stream_id, error = %e, "video append failed");
                        entry.counters.record_transient_error();
                    }
                }
            }
            let flushed = index_rows.len() as u64;
            if let Err(e) = container.borrow_mut().append_video_index(&entry.spec, &index_rows) {
                warn!(stream_id = %entry.spec.stream_id, error = %e, "video index flush failed");
                entry.counters.record_transient_error();
            } else {
                entry.counters.record_flushed(flushed);
            }
        }

        if *drain_rx.borrow() && entry.reader.occupancy() == 0 {
            let _ = sidecar.flush().await;
            return;
        }
        interval = if entry.reader.is_above_high_water() {
            base_interval / HURRY_FACTOR
        } else {
            base_interval
        };
    }
}
