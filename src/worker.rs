//! Per-camera frame acquisition.
//!
//! `AcquisitionMachine` is the connection state machine with no I/O and no
//! clock: the worker thread feeds it outcomes and executes the actions it
//! returns. `FrameAcquisitionWorker` owns one camera's connector and buffer and
//! runs the machine on its own thread until stopped.
//!
//! ```text
//! Disconnected -> Connecting -> Streaming <-> Degraded
//!       ^              |              |          |
//!       +--------------+--------------+----------+
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use rand::Rng;
use serde::Serialize;

use crate::config::{CameraSource, WorkerSettings};
use crate::error::CaptureError;
use crate::frame::{Frame, FrameBuffer};
use crate::ingest::{open_with_probe, strategies_for, ConnectStrategy, Connector, FrameReader, RawImage, Timeouts};
use crate::CameraId;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);
const RATE_EMA_ALPHA: f64 = 0.2;
const RATE_WARMUP_FRAMES: u32 = 5;

// ----------------------------------------------------------------------------
// Connection state machine
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Streaming,
    /// Frames still arrive, but slowly or with recent decode failures.
    Degraded,
}

/// What the worker must do after a per-frame failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureAction {
    /// Below the threshold: keep the connection and read again.
    RetryImmediately,
    /// Threshold reached: drop the connection, wait `delay`, rerun the strategies.
    Reconnect { delay: Duration },
}

/// Exponential backoff, doubling from `initial` up to `max`.
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: None,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.initial,
            Some(current) => current.saturating_mul(2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

/// Deterministic connection state machine for one camera.
#[derive(Clone, Debug)]
pub struct AcquisitionMachine {
    state: ConnectionState,
    failure_threshold: u32,
    consecutive_failures: u32,
    backoff: Backoff,
    connected_once: bool,
    reconnects: u64,
}

impl AcquisitionMachine {
    pub fn new(failure_threshold: u32, backoff: Backoff) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            failure_threshold: failure_threshold.max(1),
            consecutive_failures: 0,
            backoff,
            connected_once: false,
            reconnects: 0,
        }
    }

    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self::new(
            settings.failure_threshold,
            Backoff::new(settings.backoff_initial, settings.backoff_max),
        )
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Successful connections after the first one.
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    pub fn begin_connect(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// A strategy produced a decodable frame.
    pub fn on_connected(&mut self) {
        if self.connected_once {
            self.reconnects += 1;
        }
        self.connected_once = true;
        self.consecutive_failures = 0;
        self.backoff.reset();
        self.state = ConnectionState::Streaming;
    }

    /// A frame was read and published. `rate_ok` is false when the measured
    /// frame rate is below the acceptable minimum.
    pub fn on_frame(&mut self, rate_ok: bool) {
        self.consecutive_failures = 0;
        self.state = if rate_ok {
            ConnectionState::Streaming
        } else {
            ConnectionState::Degraded
        };
    }

    /// A decode failure or read timeout on an open connection.
    pub fn on_failure(&mut self) -> FailureAction {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= self.failure_threshold {
            self.state = ConnectionState::Disconnected;
            FailureAction::Reconnect {
                delay: self.backoff.next_delay(),
            }
        } else {
            self.state = ConnectionState::Degraded;
            FailureAction::RetryImmediately
        }
    }

    /// The connection ended outright (stream closed, transport error).
    pub fn on_stream_lost(&mut self) -> Duration {
        self.state = ConnectionState::Disconnected;
        self.backoff.next_delay()
    }

    /// Every strategy failed. Returns the delay before the next attempt.
    pub fn on_connect_failed(&mut self) -> Duration {
        self.state = ConnectionState::Disconnected;
        self.backoff.next_delay()
    }

    /// Forced by `stop()` when the worker thread does not exit in time.
    pub fn force_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
    }
}

/// Exponential moving average of the frame rate.
#[derive(Clone, Debug, Default)]
pub struct RateMeter {
    last_frame_at: Option<Instant>,
    ema_fps: Option<f64>,
    samples: u32,
}

impl RateMeter {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn observe(&mut self, now: Instant) {
        if let Some(last) = self.last_frame_at {
            let dt = now.saturating_duration_since(last).as_secs_f64();
            if dt > 0.0 {
                let fps = 1.0 / dt;
                self.ema_fps = Some(match self.ema_fps {
                    Some(ema) => ema + RATE_EMA_ALPHA * (fps - ema),
                    None => fps,
                });
                self.samples = self.samples.saturating_add(1);
            }
        }
        self.last_frame_at = Some(now);
    }

    pub fn fps(&self) -> Option<f64> {
        self.ema_fps
    }

    /// Whether the rate is acceptable. A `min_fps` of zero disables the check,
    /// and the first few frames after a connect are never judged.
    pub fn is_acceptable(&self, min_fps: f64) -> bool {
        if min_fps <= 0.0 || self.samples < RATE_WARMUP_FRAMES {
            return true;
        }
        self.ema_fps.map(|fps| fps >= min_fps).unwrap_or(true)
    }
}

fn with_jitter(delay: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 || delay.is_zero() {
        return delay;
    }
    let extra = delay.as_secs_f64() * fraction * rand::thread_rng().gen::<f64>();
    delay + Duration::from_secs_f64(extra)
}

// ----------------------------------------------------------------------------
// Shared status
// ----------------------------------------------------------------------------

/// Snapshot of a worker's health, readable from any thread.
#[derive(Clone, Debug, Serialize)]
pub struct WorkerStatus {
    pub camera_id: CameraId,
    pub name: String,
    pub address: String,
    pub state: ConnectionState,
    pub frames_captured: u64,
    pub consecutive_failures: u32,
    pub reconnects: u64,
    pub active_strategy: Option<ConnectStrategy>,
    pub fps: Option<f64>,
    pub last_error: Option<String>,
}

impl WorkerStatus {
    fn new(source: &CameraSource) -> Self {
        Self {
            camera_id: source.id().to_string(),
            name: source.name().to_string(),
            address: source.address(),
            state: ConnectionState::Disconnected,
            frames_captured: 0,
            consecutive_failures: 0,
            reconnects: 0,
            active_strategy: None,
            fps: None,
            last_error: None,
        }
    }
}

/// One state change of one worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateTransition {
    pub camera_id: CameraId,
    pub from: ConnectionState,
    pub to: ConnectionState,
}

fn lock_status(status: &Mutex<WorkerStatus>) -> std::sync::MutexGuard<'_, WorkerStatus> {
    match status.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ----------------------------------------------------------------------------
// Worker
// ----------------------------------------------------------------------------

/// Keeps one camera connected and its `FrameBuffer` fed.
pub struct FrameAcquisitionWorker {
    source: CameraSource,
    connector: Box<dyn Connector>,
    buffer: Arc<FrameBuffer>,
    settings: WorkerSettings,
    transitions: Option<Sender<StateTransition>>,
}

impl FrameAcquisitionWorker {
    pub fn new(
        source: CameraSource,
        connector: Box<dyn Connector>,
        buffer: Arc<FrameBuffer>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            source,
            connector,
            buffer,
            settings,
            transitions: None,
        }
    }

    /// Report every state change on `sender` in addition to logging it.
    pub fn with_transitions(mut self, sender: Sender<StateTransition>) -> Self {
        self.transitions = Some(sender);
        self
    }

    /// Start the worker thread.
    pub fn spawn(self) -> Result<WorkerHandle> {
        let camera_id = self.source.id().to_string();
        let stop = Arc::new(AtomicBool::new(false));
        let status = Arc::new(Mutex::new(WorkerStatus::new(&self.source)));
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let buffer = Arc::clone(&self.buffer);

        let worker_loop = WorkerLoop {
            machine: AcquisitionMachine::from_settings(&self.settings),
            source: self.source,
            connector: self.connector,
            buffer: self.buffer,
            settings: self.settings,
            transitions: self.transitions,
            stop: Arc::clone(&stop),
            status: Arc::clone(&status),
            rate: RateMeter::default(),
            sequence: 0,
        };
        let thread = std::thread::Builder::new()
            .name(format!("camera-{}", camera_id))
            .spawn(move || {
                worker_loop.run();
                let _ = done_tx.send(());
            })
            .with_context(|| format!("spawn worker thread for {}", camera_id))?;

        Ok(WorkerHandle {
            camera_id,
            stop,
            status,
            buffer,
            done: done_rx,
            thread: Some(thread),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// The thread exited and released its connection.
    Joined,
    /// The thread did not exit within the grace period (hung reader). It was
    /// detached and the camera marked `Disconnected`.
    Abandoned,
}

/// Owner's side of a running worker.
pub struct WorkerHandle {
    camera_id: CameraId,
    stop: Arc<AtomicBool>,
    status: Arc<Mutex<WorkerStatus>>,
    buffer: Arc<FrameBuffer>,
    done: Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn status(&self) -> WorkerStatus {
        lock_status(&self.status).clone()
    }

    pub fn buffer(&self) -> Arc<FrameBuffer> {
        Arc::clone(&self.buffer)
    }

    /// Signal the worker to stop and wait up to `grace` for it to exit.
    pub fn stop(mut self, grace: Duration) -> StopOutcome {
        self.stop.store(true, Ordering::SeqCst);
        match self.done.recv_timeout(grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(thread) = self.thread.take() {
                    if thread.join().is_err() {
                        log::error!("camera {}: worker thread panicked", self.camera_id);
                    }
                }
                StopOutcome::Joined
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "camera {}: worker did not stop within {:?}; abandoning it",
                    self.camera_id,
                    grace
                );
                lock_status(&self.status).state = ConnectionState::Disconnected;
                // Detach: the thread exits on its own once the blocked call returns.
                self.thread.take();
                StopOutcome::Abandoned
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

struct WorkerLoop {
    machine: AcquisitionMachine,
    source: CameraSource,
    connector: Box<dyn Connector>,
    buffer: Arc<FrameBuffer>,
    settings: WorkerSettings,
    transitions: Option<Sender<StateTransition>>,
    stop: Arc<AtomicBool>,
    status: Arc<Mutex<WorkerStatus>>,
    rate: RateMeter,
    sequence: u64,
}

enum StreamEnd {
    Stopped,
    Reconnect(Duration),
}

impl WorkerLoop {
    fn run(mut self) {
        log::info!(
            "camera {}: worker started for {}",
            self.source.id(),
            self.source.address()
        );
        while !self.stopped() {
            self.apply(|m| m.begin_connect());
            let Some((strategy, reader, probe)) = self.connect() else {
                if self.stopped() {
                    break;
                }
                let delay = self.apply(|m| m.on_connect_failed());
                self.sleep(with_jitter(delay, self.settings.backoff_jitter));
                continue;
            };
            if self.stopped() {
                // A probe that outlived stop() must not touch the buffer.
                drop(reader);
                break;
            }

            lock_status(&self.status).active_strategy = Some(strategy);
            self.apply(|m| m.on_connected());
            self.rate.reset();
            if let Err(err) = self.publish(probe) {
                log::warn!("camera {}: probe frame rejected: {}", self.source.id(), err);
            }

            match self.stream(reader) {
                StreamEnd::Stopped => break,
                StreamEnd::Reconnect(delay) => {
                    lock_status(&self.status).active_strategy = None;
                    self.sleep(with_jitter(delay, self.settings.backoff_jitter));
                }
            }
        }
        self.apply(|m| m.force_disconnected());
        log::info!("camera {}: worker stopped", self.source.id());
    }

    /// Walk the strategy list in order; the first strategy that yields a
    /// decodable frame wins.
    fn connect(&mut self) -> Option<(ConnectStrategy, Box<dyn FrameReader>, RawImage)> {
        let timeouts = Timeouts {
            connect: self.settings.connect_timeout,
            read: self.settings.read_timeout,
        };
        for &strategy in strategies_for(self.source.kind()) {
            if self.stopped() {
                return None;
            }
            log::info!("camera {}: trying {}", self.source.id(), strategy);
            match open_with_probe(self.connector.as_mut(), &self.source, strategy, timeouts) {
                Ok((reader, probe)) => {
                    log::info!(
                        "camera {}: connected via {} ({}x{})",
                        self.source.id(),
                        strategy,
                        probe.width,
                        probe.height
                    );
                    return Some((strategy, reader, probe));
                }
                Err(CaptureError::Unsupported(reason)) => {
                    log::info!("camera {}: {} skipped: {}", self.source.id(), strategy, reason);
                }
                Err(err) => {
                    log::warn!("camera {}: {} failed: {}", self.source.id(), strategy, err);
                    lock_status(&self.status).last_error = Some(err.to_string());
                }
            }
        }
        log::warn!(
            "camera {}: all connection strategies failed for {}",
            self.source.id(),
            self.source.address()
        );
        None
    }

    fn stream(&mut self, mut reader: Box<dyn FrameReader>) -> StreamEnd {
        loop {
            if self.stopped() {
                return StreamEnd::Stopped;
            }
            let read = reader.read_frame();
            if self.stopped() {
                return StreamEnd::Stopped;
            }
            let result = read.and_then(|image| self.publish(image));
            match result {
                Ok(()) => {
                    self.rate.observe(Instant::now());
                    let rate_ok = self.rate.is_acceptable(self.settings.min_fps);
                    self.apply(|m| m.on_frame(rate_ok));
                }
                Err(err) if err.is_per_frame() => {
                    log::debug!("camera {}: frame failed: {}", self.source.id(), err);
                    lock_status(&self.status).last_error = Some(err.to_string());
                    match self.apply(|m| m.on_failure()) {
                        FailureAction::RetryImmediately => continue,
                        FailureAction::Reconnect { delay } => {
                            log::warn!(
                                "camera {}: {} consecutive failures, reconnecting",
                                self.source.id(),
                                self.settings.failure_threshold
                            );
                            return StreamEnd::Reconnect(delay);
                        }
                    }
                }
                Err(err) => {
                    log::warn!("camera {}: stream lost: {}", self.source.id(), err);
                    lock_status(&self.status).last_error = Some(err.to_string());
                    let delay = self.apply(|m| m.on_stream_lost());
                    return StreamEnd::Reconnect(delay);
                }
            }
        }
    }

    fn publish(&mut self, image: RawImage) -> Result<(), CaptureError> {
        let RawImage {
            pixels,
            width,
            height,
        } = image;
        let frame = Frame::new(self.source.id(), self.sequence + 1, pixels, width, height)
            .ok_or_else(|| {
                CaptureError::Decode(format!("frame buffer does not match {}x{} RGB", width, height))
            })?;
        self.sequence += 1;
        self.buffer.publish(frame);
        let mut status = lock_status(&self.status);
        status.frames_captured += 1;
        status.fps = self.rate.fps();
        Ok(())
    }

    /// Run one machine operation, then mirror the result into the shared
    /// status and report any state change.
    fn apply<T>(&mut self, op: impl FnOnce(&mut AcquisitionMachine) -> T) -> T {
        let before = self.machine.state();
        let out = op(&mut self.machine);
        let after = self.machine.state();
        {
            let mut status = lock_status(&self.status);
            status.state = after;
            status.consecutive_failures = self.machine.consecutive_failures();
            status.reconnects = self.machine.reconnects();
        }
        if before != after {
            log::info!(
                "camera {}: {:?} -> {:?}",
                self.source.id(),
                before,
                after
            );
            if let Some(tx) = &self.transitions {
                let _ = tx.send(StateTransition {
                    camera_id: self.source.id().to_string(),
                    from: before,
                    to: after,
                });
            }
        }
        out
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Sleep for `delay`, waking early if stop is requested.
    fn sleep(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        while !self.stopped() {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep((deadline - now).min(STOP_POLL_INTERVAL));
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(threshold: u32) -> AcquisitionMachine {
        AcquisitionMachine::new(
            threshold,
            Backoff::new(Duration::from_millis(100), Duration::from_millis(350)),
        )
    }

    #[test]
    fn backoff_doubles_up_to_max_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        let delays: Vec<u64> = (0..4).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 350, 350]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn failures_degrade_then_disconnect_at_threshold() {
        let mut m = machine(3);
        m.begin_connect();
        assert_eq!(m.state(), ConnectionState::Connecting);
        m.on_connected();
        assert_eq!(m.state(), ConnectionState::Streaming);

        assert_eq!(m.on_failure(), FailureAction::RetryImmediately);
        assert_eq!(m.state(), ConnectionState::Degraded);
        assert_eq!(m.on_failure(), FailureAction::RetryImmediately);
        assert_eq!(
            m.on_failure(),
            FailureAction::Reconnect {
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn frame_recovers_degraded_and_clears_failures() {
        let mut m = machine(3);
        m.begin_connect();
        m.on_connected();
        m.on_failure();
        m.on_failure();
        m.on_frame(true);
        assert_eq!(m.state(), ConnectionState::Streaming);
        assert_eq!(m.consecutive_failures(), 0);
        assert_eq!(m.on_failure(), FailureAction::RetryImmediately);
    }

    #[test]
    fn slow_rate_degrades_without_counting_failures() {
        let mut m = machine(3);
        m.begin_connect();
        m.on_connected();
        m.on_frame(false);
        assert_eq!(m.state(), ConnectionState::Degraded);
        assert_eq!(m.consecutive_failures(), 0);
    }

    #[test]
    fn connect_failures_back_off_and_connect_resets() {
        let mut m = machine(3);
        m.begin_connect();
        assert_eq!(m.on_connect_failed(), Duration::from_millis(100));
        m.begin_connect();
        assert_eq!(m.on_connect_failed(), Duration::from_millis(200));
        m.begin_connect();
        m.on_connected();
        assert_eq!(m.reconnects(), 0);
        assert_eq!(m.on_stream_lost(), Duration::from_millis(100));
        m.begin_connect();
        m.on_connected();
        assert_eq!(m.reconnects(), 1);
    }

    #[test]
    fn rate_meter_flags_slow_streams_after_warmup() {
        let mut meter = RateMeter::default();
        let start = Instant::now();
        for i in 0..10u64 {
            meter.observe(start + Duration::from_millis(500 * i));
        }
        assert!((meter.fps().unwrap() - 2.0).abs() < 1e-6);
        assert!(!meter.is_acceptable(5.0));
        assert!(meter.is_acceptable(1.0));
        assert!(meter.is_acceptable(0.0));
    }

    #[test]
    fn rate_meter_does_not_judge_during_warmup() {
        let mut meter = RateMeter::default();
        let start = Instant::now();
        meter.observe(start);
        meter.observe(start + Duration::from_secs(2));
        assert!(meter.is_acceptable(30.0));
    }

    #[test]
    fn jitter_only_adds_delay() {
        let base = Duration::from_millis(100);
        for _ in 0..20 {
            let delay = with_jitter(base, 0.5);
            assert!(delay >= base && delay <= Duration::from_millis(150));
        }
        assert_eq!(with_jitter(base, 0.0), base);
    }
}
