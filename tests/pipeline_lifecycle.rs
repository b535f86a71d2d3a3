use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use camfuse::config::{CameraSource, FusionSettings, WorkerSettings};
use camfuse::detect::{
    ColorMarkerDetector, Detection, DetectionAdapter, IouTracker, PerCameraTracker, TrackedObject,
};
use camfuse::error::PerceptionError;
use camfuse::frame::Frame;
use camfuse::fusion::FusedSnapshot;
use camfuse::pipeline::{ChannelSink, Pipeline};
use camfuse::worker::{ConnectionState, StopOutcome};

fn fusion_settings() -> FusionSettings {
    FusionSettings {
        period: Duration::from_millis(20),
        ..FusionSettings::default()
    }
}

fn worker_settings() -> WorkerSettings {
    WorkerSettings {
        backoff_initial: Duration::from_millis(10),
        stop_grace: Duration::from_secs(2),
        ..WorkerSettings::default()
    }
}

fn wait_for<F>(rx: &crossbeam_channel::Receiver<FusedSnapshot>, mut done: F) -> Result<FusedSnapshot>
where
    F: FnMut(&FusedSnapshot) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if let Ok(snapshot) = rx.recv_timeout(Duration::from_millis(200)) {
            if done(&snapshot) {
                return Ok(snapshot);
            }
        }
    }
    Err(anyhow!("no matching snapshot before deadline"))
}

#[test]
fn disabled_camera_is_never_started() -> Result<()> {
    let sources = vec![
        CameraSource::stream("camera1", "Left", "stub://left?size=160x120&fps=30", true),
        CameraSource::stream("camera2", "Right", "stub://right?size=160x120&fps=30", false),
    ];
    let (tx, rx) = crossbeam_channel::bounded(64);
    let pipeline = Pipeline::builder(sources)
        .worker_settings(worker_settings())
        .fusion_settings(fusion_settings())
        .detector(|_| Box::new(ColorMarkerDetector::synthetic_marker()))
        .tracker(|_| Box::new(IouTracker::new(1, 30)))
        .start(Box::new(ChannelSink::new(tx)))?;

    assert_eq!(pipeline.cameras(), vec!["camera1".to_string()]);
    let status = pipeline.status();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].camera_id, "camera1");

    let snapshot = wait_for(&rx, |s| !s.identities.is_empty())?;
    for identity in &snapshot.identities {
        assert_eq!(identity.class_label, "marker");
        assert!(identity.cameras.keys().all(|camera| camera == "camera1"));
        assert!(identity.position.is_none());
    }
    assert_eq!(pipeline.status()[0].state, ConnectionState::Streaming);

    let outcomes = pipeline.stop();
    assert_eq!(outcomes, vec![("camera1".to_string(), StopOutcome::Joined)]);
    Ok(())
}

#[test]
fn two_stub_cameras_fuse_the_marker() -> Result<()> {
    let sources = vec![
        CameraSource::stream("camera1", "Left", "stub://left?size=160x120&fps=30", true),
        CameraSource::stream("camera2", "Right", "stub://right?size=160x120&fps=30", true),
    ];
    let (tx, rx) = crossbeam_channel::bounded(64);
    let pipeline = Pipeline::builder(sources)
        .worker_settings(worker_settings())
        .fusion_settings(fusion_settings())
        .detector(|_| Box::new(ColorMarkerDetector::synthetic_marker()))
        .tracker(|_| Box::new(IouTracker::new(1, 30)))
        .start(Box::new(ChannelSink::new(tx)))?;

    // Both scenes put the square on the same rows, so the pair is epipolar-consistent.
    let snapshot = wait_for(&rx, |s| s.identities.iter().any(|i| i.cameras.len() == 2))?;
    let fused = snapshot
        .identities
        .iter()
        .find(|i| i.cameras.len() == 2)
        .ok_or_else(|| anyhow!("no fused identity"))?;
    assert!(fused.position.is_some());

    let outcomes = pipeline.stop();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|(_, outcome)| *outcome == StopOutcome::Joined));
    Ok(())
}

#[test]
fn no_enabled_cameras_still_runs_fusion() -> Result<()> {
    let sources = vec![CameraSource::device("camera1", "Desk", 0, false)];
    let (tx, rx) = crossbeam_channel::bounded(64);
    let pipeline = Pipeline::builder(sources)
        .fusion_settings(fusion_settings())
        .start(Box::new(ChannelSink::new(tx)))?;

    assert!(pipeline.cameras().is_empty());
    let snapshot = wait_for(&rx, |s| s.cycle >= 2)?;
    assert!(snapshot.is_empty());
    assert!(pipeline.stop().is_empty());
    Ok(())
}

/// Marker detector that reports itself unavailable while `healthy` is false.
struct SwitchableDetector {
    inner: ColorMarkerDetector,
    healthy: Arc<AtomicBool>,
}

impl DetectionAdapter for SwitchableDetector {
    fn name(&self) -> &'static str {
        "switchable"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, PerceptionError> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(PerceptionError::DetectionUnavailable("model not loaded".into()));
        }
        self.inner.detect(frame)
    }
}

struct BrokenTracker;

impl PerCameraTracker for BrokenTracker {
    fn update(
        &mut self,
        _frame: &Frame,
        _detections: &[Detection],
    ) -> Result<Vec<TrackedObject>, PerceptionError> {
        Err(PerceptionError::TrackingUnavailable("tracker crashed".into()))
    }
}

fn two_stub_cameras() -> Vec<CameraSource> {
    vec![
        CameraSource::stream("camera1", "Left", "stub://left?size=160x120&fps=30", true),
        CameraSource::stream("camera2", "Right", "stub://right?size=160x120&fps=30", true),
    ]
}

/// Collect snapshots for a while after the first one with identities.
fn settle(rx: &crossbeam_channel::Receiver<FusedSnapshot>) -> Result<Vec<FusedSnapshot>> {
    let first = wait_for(rx, |s| !s.identities.is_empty())?;
    let mut seen = vec![first];
    let until = Instant::now() + Duration::from_millis(400);
    while Instant::now() < until {
        if let Ok(snapshot) = rx.recv_timeout(Duration::from_millis(100)) {
            seen.push(snapshot);
        }
    }
    Ok(seen)
}

fn only_camera1(snapshots: &[FusedSnapshot]) {
    assert!(snapshots.len() > 1);
    assert!(snapshots.windows(2).all(|w| w[0].cycle < w[1].cycle));
    for snapshot in snapshots {
        for identity in &snapshot.identities {
            assert!(
                identity.cameras.keys().all(|camera| camera == "camera1"),
                "cycle {}: {:?}",
                snapshot.cycle,
                identity.cameras.keys().collect::<Vec<_>>()
            );
        }
    }
}

#[test]
fn detection_failure_isolates_one_camera() -> Result<()> {
    let (tx, rx) = crossbeam_channel::bounded(64);
    let pipeline = Pipeline::builder(two_stub_cameras())
        .worker_settings(worker_settings())
        .fusion_settings(fusion_settings())
        .detector(|source| {
            Box::new(SwitchableDetector {
                inner: ColorMarkerDetector::synthetic_marker(),
                healthy: Arc::new(AtomicBool::new(source.id() != "camera2")),
            })
        })
        .tracker(|_| Box::new(IouTracker::new(1, 30)))
        .start(Box::new(ChannelSink::new(tx)))?;

    only_camera1(&settle(&rx)?);
    assert_eq!(pipeline.stop().len(), 2);
    Ok(())
}

#[test]
fn tracking_failure_isolates_one_camera() -> Result<()> {
    let (tx, rx) = crossbeam_channel::bounded(64);
    let pipeline = Pipeline::builder(two_stub_cameras())
        .worker_settings(worker_settings())
        .fusion_settings(fusion_settings())
        .detector(|_| Box::new(ColorMarkerDetector::synthetic_marker()))
        .tracker(|source| -> Box<dyn PerCameraTracker> {
            if source.id() == "camera2" {
                Box::new(BrokenTracker)
            } else {
                Box::new(IouTracker::new(1, 30))
            }
        })
        .start(Box::new(ChannelSink::new(tx)))?;

    only_camera1(&settle(&rx)?);
    assert_eq!(pipeline.stop().len(), 2);
    Ok(())
}

#[test]
fn failing_camera_rejoins_after_recovery() -> Result<()> {
    let camera2_healthy = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&camera2_healthy);
    let (tx, rx) = crossbeam_channel::bounded(64);
    let pipeline = Pipeline::builder(two_stub_cameras())
        .worker_settings(worker_settings())
        .fusion_settings(fusion_settings())
        .detector(move |source| {
            let healthy = if source.id() == "camera2" {
                Arc::clone(&flag)
            } else {
                Arc::new(AtomicBool::new(true))
            };
            Box::new(SwitchableDetector {
                inner: ColorMarkerDetector::synthetic_marker(),
                healthy,
            })
        })
        .tracker(|_| Box::new(IouTracker::new(1, 30)))
        .start(Box::new(ChannelSink::new(tx)))?;

    only_camera1(&settle(&rx)?);
    camera2_healthy.store(true, Ordering::SeqCst);
    let snapshot = wait_for(&rx, |s| {
        s.identities
            .iter()
            .any(|i| i.cameras.contains_key("camera2"))
    })?;
    assert!(snapshot
        .identities
        .iter()
        .any(|i| i.cameras.contains_key("camera1")));

    pipeline.stop();
    Ok(())
}
