//! camfuse - multi-camera acquisition and cross-camera identity fusion
//!
//! This crate keeps several camera streams alive independently and fuses the
//! objects tracked in each of them into one cross-camera view.
//!
//! # Architecture
//!
//! ```text
//! CameraSource -> FrameAcquisitionWorker -> FrameBuffer
//!      -> DetectionAdapter -> PerCameraTracker -> FusionEngine -> Sink
//! ```
//!
//! 1. **One worker per camera**: each worker owns its connection and never
//!    touches another camera's state.
//! 2. **Latest frame wins**: a `FrameBuffer` holds exactly one frame; nothing
//!    queues behind a slow consumer.
//! 3. **Fusion on its own cadence**: the fusion cycle reads whatever is in each
//!    buffer and never waits on camera I/O.
//! 4. **Failures become state**: connection and decode failures show up as a
//!    `ConnectionState`, collaborator failures as a missing contribution.
//!
//! # Module Structure
//!
//! - `config`: camera configuration file, calibration, tuning knobs
//! - `frame`: `Frame` and the single-slot `FrameBuffer`
//! - `ingest`: connection strategies and frame readers (device, RTSP, HTTP, FFmpeg)
//! - `worker`: connection state machine and acquisition thread
//! - `detect`: detector and per-camera tracker seams
//! - `fusion`: cross-camera matching, triangulation and identity lifecycle
//! - `pipeline`: hosts the workers and the fusion cadence, feeds a `Sink`

use serde::{Deserialize, Serialize};

pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod fusion;
pub mod ingest;
pub mod pipeline;
pub mod worker;

pub use config::{
    load_camera_sources, parse_camera_sources, CalibrationSettings, CameraCalibration,
    CameraSource, CameraSources, CamfusedConfig, ConfigIssue, FusionSettings, SourceKind,
    WorkerSettings,
};
pub use detect::{
    ColorMarkerDetector, Detection, DetectionAdapter, IouTracker, PerCameraTracker, StubDetector,
    TrackedObject,
};
pub use error::{CaptureError, PerceptionError};
pub use frame::{Frame, FrameBuffer};
pub use fusion::{
    Association, CameraBox, CameraObservations, FusedSnapshot, FusionCycle, FusionEngine,
    GlobalIdentity, IdentitySnapshot, ObjectKey,
};
pub use ingest::{
    snapshot_url, strategies_for, ConnectStrategy, Connector, FrameReader, RawImage,
    SystemConnector, Timeouts,
};
pub use pipeline::{ChannelSink, JsonLinesSink, LogSink, Pipeline, PipelineBuilder, Sink};
pub use worker::{
    AcquisitionMachine, Backoff, ConnectionState, FailureAction, FrameAcquisitionWorker,
    RateMeter, StateTransition, StopOutcome, WorkerHandle, WorkerStatus,
};

/// Camera identifier as it appears in the camera configuration (e.g. "camera1").
pub type CameraId = String;

// -------------------- Image-plane geometry --------------------

/// Axis-aligned box in image-plane pixel coordinates (corner form).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    /// Build from top-left corner plus size.
    pub fn from_xywh(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self::new(x, y, x + w, y + h)
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Intersection over union; 0.0 for disjoint or degenerate boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x1.max(other.x1);
        let top = self.y1.max(other.y1);
        let right = self.x2.min(other.x2);
        let bottom = self.y2.min(other.y2);
        if right <= left || bottom <= top {
            return 0.0;
        }
        let intersection = (right - left) * (bottom - top);
        let union = self.area() + other.area() - intersection;
        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }

    /// Euclidean distance between box centers, in pixels.
    pub fn center_distance(&self, other: &BoundingBox) -> f64 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        let dx = (ax - bx) as f64;
        let dy = (ay - by) as f64;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Estimated world position of a cross-camera identity.
///
/// Units follow the supplied calibration (meters for the stereo fallback).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position3D {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position3D {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounding_box_normalizes_corners() {
        let bbox = BoundingBox::new(50.0, 40.0, 10.0, 20.0);
        assert_eq!(bbox.x1, 10.0);
        assert_eq!(bbox.y1, 20.0);
        assert_eq!(bbox.width(), 40.0);
        assert_eq!(bbox.height(), 20.0);
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let bbox = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        assert!((bbox.iou(&bbox) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn center_distance_is_euclidean() {
        let a = BoundingBox::from_xywh(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::from_xywh(3.0, 4.0, 10.0, 10.0);
        assert!((a.center_distance(&b) - 5.0).abs() < 1e-9);
    }
}
