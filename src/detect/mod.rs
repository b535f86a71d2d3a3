//! Detection and per-camera tracking seams, with stock implementations.

mod adapter;
mod backends;
mod result;
mod tracker;

pub use adapter::{DetectionAdapter, PerCameraTracker};
pub use backends::{ColorMarkerDetector, StubDetector};
pub use result::{Detection, TrackedObject};
pub use tracker::IouTracker;

#[cfg(feature = "backend-tract")]
pub use backends::{non_max_suppression, YoloDetector, COCO_CLASSES};
