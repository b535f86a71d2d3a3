use serde::{Deserialize, Serialize};

use crate::{BoundingBox, CameraId};

/// One detector output: a labeled box in frame pixel coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class_label: String,
    pub confidence: f32,
    /// Appearance descriptor, when the detector produces one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Detection {
    pub fn new(bbox: BoundingBox, class_label: impl Into<String>, confidence: f32) -> Self {
        Self {
            bbox,
            class_label: class_label.into(),
            confidence,
            embedding: None,
        }
    }
}

/// A detection carried across frames by a per-camera tracker.
///
/// `track_id` is only meaningful within `camera_id`'s stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackedObject {
    pub track_id: u64,
    pub camera_id: CameraId,
    pub bbox: BoundingBox,
    pub class_label: String,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Sequence number of the frame the object was observed in.
    pub sequence: u64,
}

impl TrackedObject {
    pub fn new(
        camera_id: impl Into<CameraId>,
        track_id: u64,
        bbox: BoundingBox,
        class_label: impl Into<String>,
    ) -> Self {
        Self {
            track_id,
            camera_id: camera_id.into(),
            bbox,
            class_label: class_label.into(),
            confidence: 1.0,
            embedding: None,
            sequence: 0,
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }
}
