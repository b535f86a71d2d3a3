use crate::detect::result::{Detection, TrackedObject};
use crate::error::PerceptionError;
use crate::frame::Frame;

/// Turns a frame into labeled boxes.
///
/// Implementations treat the frame as read-only. A failure isolates this
/// camera's contribution for the current fusion cycle; it never stops the
/// pipeline.
pub trait DetectionAdapter: Send {
    /// Adapter identifier for logs.
    fn name(&self) -> &'static str;

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, PerceptionError>;
}

/// Assigns per-camera track ids to detections across consecutive frames.
///
/// One tracker instance serves exactly one camera. Track ids are stable within
/// that camera's stream only.
pub trait PerCameraTracker: Send {
    fn update(
        &mut self,
        frame: &Frame,
        detections: &[Detection],
    ) -> Result<Vec<TrackedObject>, PerceptionError>;
}
