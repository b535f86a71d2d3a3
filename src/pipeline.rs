//! Hosts the acquisition workers and the fusion cadence.
//!
//! One thread per enabled camera runs a `FrameAcquisitionWorker`; one more
//! thread runs the fusion cycle on a fixed period. The fusion thread only reads
//! `FrameBuffer`s, runs detection and tracking for cameras with a new frame,
//! and hands the result to a `Sink`. It never waits on camera I/O.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Sender, TrySendError};

use crate::config::{CalibrationSettings, CameraSource, FusionSettings, WorkerSettings};
use crate::detect::{DetectionAdapter, IouTracker, PerCameraTracker, StubDetector};
use crate::frame::FrameBuffer;
use crate::fusion::{CameraObservations, FusedSnapshot, FusionCycle, FusionEngine};
use crate::ingest::{Connector, SystemConnector};
use crate::worker::{FrameAcquisitionWorker, StateTransition, StopOutcome, WorkerHandle, WorkerStatus};
use crate::CameraId;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(20);

// -------------------- Sinks --------------------

/// Consumer of fused snapshots, called once per fusion cycle on the fusion
/// thread. An error is logged and the pipeline carries on.
pub trait Sink: Send {
    fn publish(&mut self, cycle: &FusionCycle) -> Result<()>;
}

/// Logs a one-line summary per cycle, identities at debug level.
#[derive(Default)]
pub struct LogSink {
    last_count: Option<usize>,
}

impl Sink for LogSink {
    fn publish(&mut self, cycle: &FusionCycle) -> Result<()> {
        let snapshot = &cycle.snapshot;
        let count = snapshot.identities.len();
        if self.last_count != Some(count) {
            log::info!("cycle {}: {} identities", snapshot.cycle, count);
            self.last_count = Some(count);
        }
        for identity in &snapshot.identities {
            log::debug!(
                "  #{} {} cameras={:?} position={:?} age={}",
                identity.global_id,
                identity.class_label,
                identity.camera_map(),
                identity.position,
                identity.age
            );
        }
        Ok(())
    }
}

/// Writes every snapshot as one JSON object per line.
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> Sink for JsonLinesSink<W> {
    fn publish(&mut self, cycle: &FusionCycle) -> Result<()> {
        serde_json::to_writer(&mut self.writer, &cycle.snapshot)
            .context("serialize fused snapshot")?;
        self.writer.write_all(b"\n").context("write snapshot")?;
        self.writer.flush().context("flush snapshot")?;
        Ok(())
    }
}

/// Forwards snapshots over a channel. A full channel drops the snapshot;
/// the next cycle supersedes it anyway.
pub struct ChannelSink {
    sender: Sender<FusedSnapshot>,
}

impl ChannelSink {
    pub fn new(sender: Sender<FusedSnapshot>) -> Self {
        Self { sender }
    }
}

impl Sink for ChannelSink {
    fn publish(&mut self, cycle: &FusionCycle) -> Result<()> {
        match self.sender.try_send(cycle.snapshot.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Disconnected(_)) => Err(anyhow!("snapshot receiver dropped")),
        }
    }
}

// -------------------- Builder --------------------

type ConnectorFactory = Box<dyn Fn(&CameraSource) -> Box<dyn Connector>>;
type DetectorFactory = Box<dyn Fn(&CameraSource) -> Box<dyn DetectionAdapter>>;
type TrackerFactory = Box<dyn Fn(&CameraSource) -> Box<dyn PerCameraTracker>>;

pub struct PipelineBuilder {
    sources: Vec<CameraSource>,
    worker: WorkerSettings,
    fusion: FusionSettings,
    calibration: CalibrationSettings,
    connector: ConnectorFactory,
    detector: DetectorFactory,
    tracker: TrackerFactory,
    transitions: Option<Sender<StateTransition>>,
}

impl PipelineBuilder {
    pub fn worker_settings(mut self, settings: WorkerSettings) -> Self {
        self.worker = settings;
        self
    }

    pub fn fusion_settings(mut self, settings: FusionSettings) -> Self {
        self.fusion = settings;
        self
    }

    pub fn calibration(mut self, calibration: CalibrationSettings) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn connector<F>(mut self, factory: F) -> Self
    where
        F: Fn(&CameraSource) -> Box<dyn Connector> + 'static,
    {
        self.connector = Box::new(factory);
        self
    }

    pub fn detector<F>(mut self, factory: F) -> Self
    where
        F: Fn(&CameraSource) -> Box<dyn DetectionAdapter> + 'static,
    {
        self.detector = Box::new(factory);
        self
    }

    pub fn tracker<F>(mut self, factory: F) -> Self
    where
        F: Fn(&CameraSource) -> Box<dyn PerCameraTracker> + 'static,
    {
        self.tracker = Box::new(factory);
        self
    }

    /// Receive every worker state change on `sender`.
    pub fn transitions(mut self, sender: Sender<StateTransition>) -> Self {
        self.transitions = Some(sender);
        self
    }

    /// Start one worker per enabled source and the fusion thread.
    pub fn start(self, sink: Box<dyn Sink>) -> Result<Pipeline> {
        self.fusion.validate()?;

        let mut workers = Vec::new();
        let mut lanes = Vec::new();
        for source in self.sources {
            if !source.enabled() {
                log::info!("camera {} ({}) disabled; not starting", source.id(), source.name());
                continue;
            }
            let buffer = Arc::new(FrameBuffer::new());
            lanes.push(CameraLane {
                camera_id: source.id().to_string(),
                buffer: Arc::clone(&buffer),
                detector: (self.detector)(&source),
                tracker: (self.tracker)(&source),
                last_sequence: None,
                failing: false,
            });

            let connector = (self.connector)(&source);
            let mut worker =
                FrameAcquisitionWorker::new(source, connector, buffer, self.worker.clone());
            if let Some(sender) = &self.transitions {
                worker = worker.with_transitions(sender.clone());
            }
            match worker.spawn() {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    stop_workers(workers, self.worker.stop_grace);
                    return Err(err);
                }
            }
        }
        if workers.is_empty() {
            log::warn!("no enabled cameras; fusion will emit empty snapshots");
        }

        let stop = Arc::new(AtomicBool::new(false));
        let fusion_loop = FusionLoop {
            engine: FusionEngine::new(self.fusion.clone(), self.calibration),
            lanes,
            sink,
            period: self.fusion.period,
            stop: Arc::clone(&stop),
            sink_failing: false,
        };
        let fusion = match std::thread::Builder::new()
            .name("fusion".into())
            .spawn(move || fusion_loop.run())
        {
            Ok(thread) => thread,
            Err(err) => {
                stop_workers(workers, self.worker.stop_grace);
                return Err(err).context("spawn fusion thread");
            }
        };

        Ok(Pipeline {
            workers,
            fusion_stop: stop,
            fusion: Some(fusion),
            stop_grace: self.worker.stop_grace,
        })
    }
}

fn stop_workers(workers: Vec<WorkerHandle>, grace: Duration) -> Vec<(CameraId, StopOutcome)> {
    workers
        .into_iter()
        .map(|handle| {
            let camera_id = handle.camera_id().to_string();
            let outcome = handle.stop(grace);
            (camera_id, outcome)
        })
        .collect()
}

// -------------------- Pipeline --------------------

/// Running workers plus the fusion thread.
pub struct Pipeline {
    workers: Vec<WorkerHandle>,
    fusion_stop: Arc<AtomicBool>,
    fusion: Option<JoinHandle<()>>,
    stop_grace: Duration,
}

impl Pipeline {
    /// Defaults: system connector, no-op detector, IoU tracker.
    pub fn builder(sources: Vec<CameraSource>) -> PipelineBuilder {
        PipelineBuilder {
            sources,
            worker: WorkerSettings::default(),
            fusion: FusionSettings::default(),
            calibration: CalibrationSettings::default(),
            connector: Box::new(|_| Box::new(SystemConnector::new())),
            detector: Box::new(|_| Box::new(StubDetector)),
            tracker: Box::new(|_| Box::new(IouTracker::default())),
            transitions: None,
        }
    }

    /// Ids of the cameras with a running worker.
    pub fn cameras(&self) -> Vec<CameraId> {
        self.workers.iter().map(|w| w.camera_id().to_string()).collect()
    }

    pub fn status(&self) -> Vec<WorkerStatus> {
        self.workers.iter().map(WorkerHandle::status).collect()
    }

    /// Stop fusion first, then every worker with the configured grace.
    pub fn stop(mut self) -> Vec<(CameraId, StopOutcome)> {
        self.fusion_stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.fusion.take() {
            if thread.join().is_err() {
                log::error!("fusion thread panicked");
            }
        }
        let outcomes = stop_workers(std::mem::take(&mut self.workers), self.stop_grace);
        log::info!("pipeline stopped ({} cameras)", outcomes.len());
        outcomes
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.fusion_stop.store(true, Ordering::SeqCst);
    }
}

// -------------------- Fusion thread --------------------

struct CameraLane {
    camera_id: CameraId,
    buffer: Arc<FrameBuffer>,
    detector: Box<dyn DetectionAdapter>,
    tracker: Box<dyn PerCameraTracker>,
    last_sequence: Option<u64>,
    /// Set while collaborator failures repeat; only the first is logged.
    failing: bool,
}

impl CameraLane {
    /// Tracked objects for a frame newer than the last one seen, if any.
    fn observe(&mut self) -> Option<CameraObservations> {
        let frame = self.buffer.latest()?;
        if self.last_sequence == Some(frame.sequence()) {
            return None;
        }
        self.last_sequence = Some(frame.sequence());

        let result = self
            .detector
            .detect(&frame)
            .and_then(|detections| self.tracker.update(&frame, &detections));
        match result {
            Ok(objects) => {
                if self.failing {
                    log::info!("camera {}: perception recovered", self.camera_id);
                    self.failing = false;
                }
                Some(CameraObservations::new(self.camera_id.clone(), objects))
            }
            Err(err) => {
                if !self.failing {
                    log::warn!(
                        "camera {}: {} failed, skipping camera until it recovers: {}",
                        self.camera_id,
                        self.detector.name(),
                        err
                    );
                    self.failing = true;
                }
                None
            }
        }
    }
}

struct FusionLoop {
    engine: FusionEngine,
    lanes: Vec<CameraLane>,
    sink: Box<dyn Sink>,
    period: Duration,
    stop: Arc<AtomicBool>,
    sink_failing: bool,
}

impl FusionLoop {
    fn run(mut self) {
        log::info!(
            "fusion running every {:?} over {} cameras",
            self.period,
            self.lanes.len()
        );
        while !self.stop.load(Ordering::SeqCst) {
            let started = Instant::now();
            self.cycle();
            self.sleep_until(started + self.period);
        }
        log::info!("fusion stopped after {} cycles", self.engine.cycle());
    }

    fn cycle(&mut self) {
        let observations: Vec<CameraObservations> =
            self.lanes.iter_mut().filter_map(CameraLane::observe).collect();
        let cycle = self.engine.run_cycle(&observations);
        match self.sink.publish(&cycle) {
            Ok(()) => self.sink_failing = false,
            Err(err) => {
                if !self.sink_failing {
                    log::warn!("sink rejected cycle {}: {:#}", cycle.snapshot.cycle, err);
                    self.sink_failing = true;
                }
            }
        }
    }

    fn sleep_until(&self, deadline: Instant) {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep((deadline - now).min(STOP_POLL_INTERVAL));
        }
    }
}
