use std::collections::BTreeMap;

use serde::Serialize;

use crate::detect::TrackedObject;
use crate::{BoundingBox, CameraId, Position3D};

/// One camera's view of a global identity.
#[derive(Clone, Debug, PartialEq)]
pub struct Contribution {
    pub track_id: u64,
    pub bbox: BoundingBox,
    pub class_label: String,
    pub confidence: f32,
    pub embedding: Option<Vec<f32>>,
    /// Frame sequence the box was observed in.
    pub sequence: u64,
    /// Fusion cycles since this camera last matched the identity.
    pub cycles_since_match: u32,
}

impl Contribution {
    fn from_object(object: &TrackedObject) -> Self {
        Self {
            track_id: object.track_id,
            bbox: object.bbox,
            class_label: object.class_label.clone(),
            confidence: object.confidence,
            embedding: object.embedding.clone(),
            sequence: object.sequence,
            cycles_since_match: 0,
        }
    }
}

/// Durable cross-camera identity, owned and mutated only by the fusion engine.
///
/// Holds at most one per-camera track per camera: contributions are keyed by
/// camera id.
#[derive(Clone, Debug)]
pub struct GlobalIdentity {
    id: u64,
    contributions: BTreeMap<CameraId, Contribution>,
    position: Option<Position3D>,
    triangulated: bool,
    age: u64,
    cycles_since_match: u32,
}

impl GlobalIdentity {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            contributions: BTreeMap::new(),
            position: None,
            triangulated: false,
            age: 0,
            cycles_since_match: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cycles since the identity was created.
    pub fn age(&self) -> u64 {
        self.age
    }

    pub fn cycles_since_match(&self) -> u32 {
        self.cycles_since_match
    }

    /// Last fused position; present only while two or more cameras contribute.
    pub fn position(&self) -> Option<Position3D> {
        self.position
    }

    /// True when `position` came from calibrated triangulation rather than the
    /// stereo fallback, i.e. it is expressed in calibrated world coordinates.
    pub fn is_triangulated(&self) -> bool {
        self.position.is_some() && self.triangulated
    }

    pub fn contributions(&self) -> &BTreeMap<CameraId, Contribution> {
        &self.contributions
    }

    pub fn contribution(&self, camera_id: &str) -> Option<&Contribution> {
        self.contributions.get(camera_id)
    }

    /// Camera id to per-camera track id.
    pub fn camera_map(&self) -> BTreeMap<CameraId, u64> {
        self.contributions
            .iter()
            .map(|(camera, c)| (camera.clone(), c.track_id))
            .collect()
    }

    /// Majority label across contributing cameras. Ties go to the higher summed
    /// confidence, then to the lexicographically smaller label.
    pub fn class_label(&self) -> &str {
        let mut votes: BTreeMap<&str, (usize, f32)> = BTreeMap::new();
        for c in self.contributions.values() {
            let entry = votes.entry(c.class_label.as_str()).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += c.confidence;
        }
        // BTreeMap iterates labels in ascending order; strict comparison keeps
        // the smaller label on a full tie.
        let mut best: Option<(&str, usize, f32)> = None;
        for (label, (count, confidence)) in votes {
            let better = match best {
                None => true,
                Some((_, best_count, best_conf)) => {
                    count > best_count || (count == best_count && confidence > best_conf)
                }
            };
            if better {
                best = Some((label, count, confidence));
            }
        }
        best.map(|(label, _, _)| label).unwrap_or("")
    }

    /// Record a match with `object`, replacing any earlier track from the same
    /// camera.
    pub(crate) fn observe(&mut self, object: &TrackedObject) {
        self.contributions
            .insert(object.camera_id.clone(), Contribution::from_object(object));
    }

    /// Advance one cycle. `matched` lists the cameras that matched this cycle.
    /// Contributions unmatched for more than `ttl` cycles are pruned.
    pub(crate) fn age_by_one_cycle(&mut self, matched: &[CameraId], is_new: bool, ttl: u32) {
        if !is_new {
            self.age += 1;
        }
        if matched.is_empty() {
            self.cycles_since_match = self.cycles_since_match.saturating_add(1);
        } else {
            self.cycles_since_match = 0;
        }
        for (camera, c) in self.contributions.iter_mut() {
            if matched.iter().any(|m| m == camera) {
                c.cycles_since_match = 0;
            } else {
                c.cycles_since_match = c.cycles_since_match.saturating_add(1);
            }
        }
        self.contributions.retain(|_, c| c.cycles_since_match <= ttl);
        if self.contributions.len() < 2 {
            self.position = None;
            self.triangulated = false;
        }
    }

    pub(crate) fn is_expired(&self, ttl: u32) -> bool {
        self.cycles_since_match > ttl || self.contributions.is_empty()
    }

    pub(crate) fn set_position(&mut self, position: Position3D, triangulated: bool) {
        self.position = Some(position);
        self.triangulated = triangulated;
    }

    pub fn snapshot(&self) -> IdentitySnapshot {
        IdentitySnapshot {
            global_id: self.id,
            class_label: self.class_label().to_string(),
            cameras: self
                .contributions
                .iter()
                .map(|(camera, c)| {
                    (
                        camera.clone(),
                        CameraBox {
                            track_id: c.track_id,
                            bbox: c.bbox,
                            confidence: c.confidence,
                            sequence: c.sequence,
                        },
                    )
                })
                .collect(),
            position: self.position,
            age: self.age,
            cycles_since_match: self.cycles_since_match,
        }
    }
}

/// A contributing camera's box as reported to sinks.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CameraBox {
    pub track_id: u64,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub sequence: u64,
}

/// Immutable view of one identity in a fused snapshot.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IdentitySnapshot {
    pub global_id: u64,
    pub class_label: String,
    pub cameras: BTreeMap<CameraId, CameraBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position3D>,
    pub age: u64,
    pub cycles_since_match: u32,
}

impl IdentitySnapshot {
    pub fn camera_map(&self) -> BTreeMap<CameraId, u64> {
        self.cameras
            .iter()
            .map(|(camera, b)| (camera.clone(), b.track_id))
            .collect()
    }
}
