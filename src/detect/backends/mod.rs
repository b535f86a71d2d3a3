pub mod cpu;
pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use cpu::ColorMarkerDetector;
pub use stub::StubDetector;

#[cfg(feature = "backend-tract")]
pub use tract::{non_max_suppression, YoloDetector, COCO_CLASSES};
