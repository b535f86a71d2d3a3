//! Association cost. Lower is better; `f64::INFINITY` never matches.

use crate::config::{CalibrationSettings, FusionSettings};
use crate::detect::TrackedObject;
use crate::fusion::geometry::{self, View};
use crate::fusion::identity::GlobalIdentity;
use crate::BoundingBox;

fn center(bbox: &BoundingBox) -> (f64, f64) {
    let (x, y) = bbox.center();
    (f64::from(x), f64::from(y))
}

/// `1 - cos(a, b)`; `None` for mismatched lengths or zero vectors.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a <= 0.0 || norm_b <= 0.0 {
        return None;
    }
    Some(1.0 - dot / (norm_a.sqrt() * norm_b.sqrt()))
}

pub struct CostModel<'a> {
    settings: &'a FusionSettings,
    calibration: &'a CalibrationSettings,
}

impl<'a> CostModel<'a> {
    pub fn new(settings: &'a FusionSettings, calibration: &'a CalibrationSettings) -> Self {
        Self {
            settings,
            calibration,
        }
    }

    /// Pixel-scale disagreement between two boxes seen by different cameras.
    ///
    /// Calibrated pairs use two-view reprojection error; anything else is
    /// treated as a rectified parallel rig and compared row against row.
    pub fn geometric_distance(
        &self,
        camera_a: &str,
        box_a: &BoundingBox,
        camera_b: &str,
        box_b: &BoundingBox,
    ) -> f64 {
        match (
            self.calibration.cameras.get(camera_a),
            self.calibration.cameras.get(camera_b),
        ) {
            (Some(cal_a), Some(cal_b)) => geometry::pair_consistency(
                View {
                    calibration: cal_a,
                    pixel: center(box_a),
                },
                View {
                    calibration: cal_b,
                    pixel: center(box_b),
                },
            ),
            _ => geometry::rectified_epipolar_distance(center(box_a), center(box_b)),
        }
    }

    fn embedding_term(&self, a: Option<&Vec<f32>>, b: Option<&Vec<f32>>) -> f64 {
        match (a, b) {
            (Some(a), Some(b)) => cosine_distance(a, b)
                .map(|d| self.settings.embedding_weight * d)
                .unwrap_or(0.0),
            _ => 0.0,
        }
    }

    fn class_term(&self, a: &str, b: &str) -> f64 {
        if a == b {
            0.0
        } else {
            self.settings.class_mismatch_penalty
        }
    }

    fn combine(&self, distance_px: f64, class_term: f64, embedding_term: f64) -> f64 {
        if !distance_px.is_finite() {
            return f64::INFINITY;
        }
        distance_px / self.settings.distance_scale_px + class_term + embedding_term
    }

    /// Cost of re-associating `object` with an existing identity.
    pub fn identity_cost(&self, identity: &GlobalIdentity, object: &TrackedObject) -> f64 {
        let same_camera = identity.contribution(&object.camera_id);
        let reference = same_camera.or_else(|| identity.contributions().values().next());
        let Some(reference) = reference else {
            return f64::INFINITY;
        };

        let projected = identity
            .position()
            .filter(|_| identity.is_triangulated())
            .zip(self.calibration.cameras.get(&object.camera_id))
            .map(|(position, cal)| match geometry::project(cal, &position) {
                Some((u, v)) => {
                    let (x, y) = center(&object.bbox);
                    ((u - x).powi(2) + (v - y).powi(2)).sqrt()
                }
                None => f64::INFINITY,
            });

        let distance = match (projected, same_camera) {
            (Some(distance), _) => distance,
            (None, Some(previous)) => previous.bbox.center_distance(&object.bbox),
            (None, None) => {
                let (camera, first) = match identity.contributions().iter().next() {
                    Some(entry) => entry,
                    None => return f64::INFINITY,
                };
                self.geometric_distance(camera, &first.bbox, &object.camera_id, &object.bbox)
            }
        };

        self.combine(
            distance,
            self.class_term(identity.class_label(), &object.class_label),
            self.embedding_term(reference.embedding.as_ref(), object.embedding.as_ref()),
        )
    }

    /// Cost of founding a new identity from two unmatched objects in different
    /// cameras. Objects of different classes never pair.
    pub fn pair_cost(&self, a: &TrackedObject, b: &TrackedObject) -> f64 {
        if a.camera_id == b.camera_id || a.class_label != b.class_label {
            return f64::INFINITY;
        }
        self.combine(
            self.geometric_distance(&a.camera_id, &a.bbox, &b.camera_id, &b.bbox),
            0.0,
            self.embedding_term(a.embedding.as_ref(), b.embedding.as_ref()),
        )
    }
}
