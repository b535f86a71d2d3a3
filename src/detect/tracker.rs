//! Baseline per-camera tracker: greedy IoU association with tentative tracks.
//!
//! A new track starts tentative and is confirmed after `n_init` consecutive
//! hits. A tentative track that misses once is dropped; a confirmed track
//! coasts for up to `max_age` frames without a detection. Only confirmed tracks
//! seen in the current frame are reported.

use crate::detect::adapter::PerCameraTracker;
use crate::detect::result::{Detection, TrackedObject};
use crate::error::PerceptionError;
use crate::frame::Frame;
use crate::BoundingBox;

const DEFAULT_MIN_IOU: f32 = 0.3;
const DEFAULT_N_INIT: u32 = 3;
const DEFAULT_MAX_AGE: u32 = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TrackState {
    Tentative,
    Confirmed,
}

#[derive(Clone, Debug)]
struct Track {
    id: u64,
    bbox: BoundingBox,
    class_label: String,
    confidence: f32,
    embedding: Option<Vec<f32>>,
    state: TrackState,
    hits: u32,
    misses: u32,
}

#[derive(Clone, Debug)]
pub struct IouTracker {
    min_iou: f32,
    n_init: u32,
    max_age: u32,
    next_id: u64,
    tracks: Vec<Track>,
}

impl Default for IouTracker {
    fn default() -> Self {
        Self::new(DEFAULT_N_INIT, DEFAULT_MAX_AGE)
    }
}

impl IouTracker {
    pub fn new(n_init: u32, max_age: u32) -> Self {
        Self {
            min_iou: DEFAULT_MIN_IOU,
            n_init: n_init.max(1),
            max_age,
            next_id: 1,
            tracks: Vec::new(),
        }
    }

    pub fn with_min_iou(mut self, min_iou: f32) -> Self {
        self.min_iou = min_iou;
        self
    }

    /// Tracks currently held, confirmed or not.
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    fn associate(&self, detections: &[Detection]) -> Vec<(usize, usize)> {
        let mut candidates: Vec<(f32, u64, usize, usize)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (di, det) in detections.iter().enumerate() {
                if det.class_label != track.class_label {
                    continue;
                }
                let iou = track.bbox.iou(&det.bbox);
                if iou >= self.min_iou {
                    candidates.push((iou, track.id, ti, di));
                }
            }
        }
        candidates.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then(a.1.cmp(&b.1))
                .then(a.3.cmp(&b.3))
        });

        let mut track_used = vec![false; self.tracks.len()];
        let mut det_used = vec![false; detections.len()];
        let mut pairs = Vec::new();
        for (_, _, ti, di) in candidates {
            if track_used[ti] || det_used[di] {
                continue;
            }
            track_used[ti] = true;
            det_used[di] = true;
            pairs.push((ti, di));
        }
        pairs
    }
}

impl PerCameraTracker for IouTracker {
    fn update(
        &mut self,
        frame: &Frame,
        detections: &[Detection],
    ) -> Result<Vec<TrackedObject>, PerceptionError> {
        let pairs = self.associate(detections);

        let mut track_hit = vec![false; self.tracks.len()];
        let mut det_used = vec![false; detections.len()];
        for &(ti, di) in &pairs {
            let det = &detections[di];
            let track = &mut self.tracks[ti];
            track.bbox = det.bbox;
            track.confidence = det.confidence;
            track.embedding = det.embedding.clone();
            track.hits += 1;
            track.misses = 0;
            if track.hits >= self.n_init {
                track.state = TrackState::Confirmed;
            }
            track_hit[ti] = true;
            det_used[di] = true;
        }

        for (track, hit) in self.tracks.iter_mut().zip(&track_hit) {
            if !hit {
                track.misses += 1;
            }
        }
        let max_age = self.max_age;
        self.tracks.retain(|track| match track.state {
            TrackState::Tentative => track.misses == 0,
            TrackState::Confirmed => track.misses <= max_age,
        });

        for (det, _) in detections.iter().zip(&det_used).filter(|(_, used)| !**used) {
            let state = if self.n_init <= 1 {
                TrackState::Confirmed
            } else {
                TrackState::Tentative
            };
            self.tracks.push(Track {
                id: self.next_id,
                bbox: det.bbox,
                class_label: det.class_label.clone(),
                confidence: det.confidence,
                embedding: det.embedding.clone(),
                state,
                hits: 1,
                misses: 0,
            });
            self.next_id += 1;
        }

        Ok(self
            .tracks
            .iter()
            .filter(|t| t.state == TrackState::Confirmed && t.misses == 0)
            .map(|t| TrackedObject {
                track_id: t.id,
                camera_id: frame.camera_id().to_string(),
                bbox: t.bbox,
                class_label: t.class_label.clone(),
                confidence: t.confidence,
                embedding: t.embedding.clone(),
                sequence: frame.sequence(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(sequence: u64) -> Frame {
        Frame::new("camera1", sequence, vec![0u8; 4 * 4 * 3], 4, 4).unwrap()
    }

    fn person(x: f32) -> Detection {
        Detection::new(BoundingBox::new(x, 10.0, x + 40.0, 90.0), "person", 0.9)
    }

    #[test]
    fn track_confirms_after_n_init_hits() {
        let mut tracker = IouTracker::new(3, 30);
        assert!(tracker.update(&frame(1), &[person(10.0)]).unwrap().is_empty());
        assert!(tracker.update(&frame(2), &[person(12.0)]).unwrap().is_empty());
        let out = tracker.update(&frame(3), &[person(14.0)]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].track_id, 1);
        assert_eq!(out[0].camera_id, "camera1");
        assert_eq!(out[0].sequence, 3);
    }

    #[test]
    fn confirmed_track_survives_gaps_up_to_max_age() {
        let mut tracker = IouTracker::new(1, 2);
        assert_eq!(tracker.update(&frame(1), &[person(10.0)]).unwrap()[0].track_id, 1);
        assert!(tracker.update(&frame(2), &[]).unwrap().is_empty());
        assert!(tracker.update(&frame(3), &[]).unwrap().is_empty());
        let out = tracker.update(&frame(4), &[person(11.0)]).unwrap();
        assert_eq!(out[0].track_id, 1);

        tracker.update(&frame(5), &[]).unwrap();
        tracker.update(&frame(6), &[]).unwrap();
        tracker.update(&frame(7), &[]).unwrap();
        assert!(tracker.is_empty());
    }

    #[test]
    fn tentative_track_dropped_on_first_miss() {
        let mut tracker = IouTracker::new(3, 30);
        tracker.update(&frame(1), &[person(10.0)]).unwrap();
        tracker.update(&frame(2), &[]).unwrap();
        assert!(tracker.is_empty());
    }

    #[test]
    fn class_change_starts_new_track() {
        let mut tracker = IouTracker::new(1, 30);
        tracker.update(&frame(1), &[person(10.0)]).unwrap();
        let car = Detection::new(BoundingBox::new(10.0, 10.0, 50.0, 90.0), "car", 0.9);
        let out = tracker.update(&frame(2), &[car]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].track_id, 2);
    }
}
