//! Cross-camera identity fusion.
//!
//! Each call to [`FusionEngine::run_cycle`] takes the latest tracked objects of
//! every camera and:
//!
//! 1. re-associates identities whose per-camera track ids reappear;
//! 2. greedily matches the remaining objects to identities by ascending cost,
//!    never above `max_cost`;
//! 3. pairs leftover objects across cameras into new identities, or founds a
//!    single-camera identity for each object that pairs with nothing;
//! 4. ages identities and their per-camera contributions, evicting anything
//!    unmatched for more than `ttl_cycles`;
//! 5. recomputes positions for identities seen by two or more cameras;
//! 6. returns the full identity set as a snapshot tagged with the cycle number.
//!
//! Equal costs resolve toward the smaller per-camera track id, so a cycle is a
//! pure function of the engine state and its input.

mod cost;
pub mod geometry;
mod identity;

use std::collections::{BTreeMap, HashSet};

use log::debug;
use serde::Serialize;

use crate::config::{CalibrationSettings, FusionSettings};
use crate::detect::TrackedObject;
use crate::CameraId;

pub use cost::{cosine_distance, CostModel};
pub use identity::{CameraBox, Contribution, GlobalIdentity, IdentitySnapshot};

/// One camera's tracked objects for a cycle. Cameras without a fresh frame
/// are simply left out.
#[derive(Clone, Debug, Default)]
pub struct CameraObservations {
    pub camera_id: CameraId,
    pub objects: Vec<TrackedObject>,
}

impl CameraObservations {
    pub fn new(camera_id: impl Into<CameraId>, objects: Vec<TrackedObject>) -> Self {
        Self {
            camera_id: camera_id.into(),
            objects,
        }
    }
}

/// A per-camera object as referenced in association results.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ObjectKey {
    pub camera_id: CameraId,
    pub track_id: u64,
}

impl ObjectKey {
    fn of(object: &TrackedObject) -> Self {
        Self {
            camera_id: object.camera_id.clone(),
            track_id: object.track_id,
        }
    }
}

/// What happened to one tracked object in a cycle.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Association {
    /// Joined an identity that existed before this cycle.
    Matched { global_id: u64, object: ObjectKey },
    /// Paired with an object from another camera into a new identity.
    NewCrossCameraPair {
        global_id: u64,
        objects: [ObjectKey; 2],
    },
    /// Matched nothing; founded a single-camera identity.
    Unmatched { global_id: u64, object: ObjectKey },
}

impl Association {
    pub fn global_id(&self) -> u64 {
        match self {
            Association::Matched { global_id, .. }
            | Association::NewCrossCameraPair { global_id, .. }
            | Association::Unmatched { global_id, .. } => *global_id,
        }
    }
}

/// The set handed to sinks once per cycle, ordered by global id.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FusedSnapshot {
    pub cycle: u64,
    pub identities: Vec<IdentitySnapshot>,
}

impl FusedSnapshot {
    pub fn identity(&self, global_id: u64) -> Option<&IdentitySnapshot> {
        self.identities.iter().find(|i| i.global_id == global_id)
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FusionCycle {
    pub snapshot: FusedSnapshot,
    pub associations: Vec<Association>,
}

pub struct FusionEngine {
    settings: FusionSettings,
    calibration: CalibrationSettings,
    identities: BTreeMap<u64, GlobalIdentity>,
    next_id: u64,
    cycle: u64,
}

impl FusionEngine {
    pub fn new(settings: FusionSettings, calibration: CalibrationSettings) -> Self {
        Self {
            settings,
            calibration,
            identities: BTreeMap::new(),
            next_id: 1,
            cycle: 0,
        }
    }

    pub fn settings(&self) -> &FusionSettings {
        &self.settings
    }

    /// Number of completed cycles.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn identities(&self) -> impl Iterator<Item = &GlobalIdentity> {
        self.identities.values()
    }

    pub fn identity(&self, global_id: u64) -> Option<&GlobalIdentity> {
        self.identities.get(&global_id)
    }

    pub fn snapshot(&self) -> FusedSnapshot {
        FusedSnapshot {
            cycle: self.cycle,
            identities: self.identities.values().map(GlobalIdentity::snapshot).collect(),
        }
    }

    pub fn run_cycle(&mut self, observations: &[CameraObservations]) -> FusionCycle {
        self.cycle += 1;
        let objects = flatten(observations);

        let mut assigned = vec![false; objects.len()];
        let mut matched: BTreeMap<u64, Vec<CameraId>> = BTreeMap::new();
        let mut associations = Vec::new();

        self.reassociate_tracks(&objects, &mut assigned, &mut matched, &mut associations);
        self.match_by_cost(&objects, &mut assigned, &mut matched, &mut associations);
        let created = self.found_identities(&objects, &mut assigned, &mut matched, &mut associations);

        self.age_and_evict(&matched, &created);
        self.update_positions();

        let snapshot = self.snapshot();
        debug!(
            "fusion cycle {}: {} objects, {} identities ({} new)",
            self.cycle,
            objects.len(),
            snapshot.identities.len(),
            created.len()
        );
        FusionCycle {
            snapshot,
            associations,
        }
    }

    /// Step 1: an identity keeps any per-camera track that is still present.
    fn reassociate_tracks(
        &mut self,
        objects: &[&TrackedObject],
        assigned: &mut [bool],
        matched: &mut BTreeMap<u64, Vec<CameraId>>,
        associations: &mut Vec<Association>,
    ) {
        for (global_id, identity) in self.identities.iter_mut() {
            let keys: Vec<(CameraId, u64)> = identity
                .contributions()
                .iter()
                .map(|(camera, c)| (camera.clone(), c.track_id))
                .collect();
            for (camera, track_id) in keys {
                let found = objects.iter().enumerate().find(|(i, o)| {
                    !assigned[*i] && o.camera_id == camera && o.track_id == track_id
                });
                if let Some((i, object)) = found {
                    assigned[i] = true;
                    identity.observe(object);
                    matched.entry(*global_id).or_default().push(camera);
                    associations.push(Association::Matched {
                        global_id: *global_id,
                        object: ObjectKey::of(object),
                    });
                }
            }
        }
    }

    /// Step 2: greedy minimum-cost assignment under the `max_cost` ceiling.
    fn match_by_cost(
        &mut self,
        objects: &[&TrackedObject],
        assigned: &mut [bool],
        matched: &mut BTreeMap<u64, Vec<CameraId>>,
        associations: &mut Vec<Association>,
    ) {
        let model = CostModel::new(&self.settings, &self.calibration);
        let mut candidates: Vec<(f64, usize, u64)> = Vec::new();
        for (global_id, identity) in &self.identities {
            let taken = matched.get(global_id);
            for (i, object) in objects.iter().enumerate() {
                if assigned[i] || taken.is_some_and(|cams| cams.contains(&object.camera_id)) {
                    continue;
                }
                let cost = model.identity_cost(identity, object);
                if cost <= self.settings.max_cost {
                    candidates.push((cost, i, *global_id));
                }
            }
        }
        candidates.sort_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then(objects[a.1].track_id.cmp(&objects[b.1].track_id))
                .then(objects[a.1].camera_id.cmp(&objects[b.1].camera_id))
                .then(a.2.cmp(&b.2))
        });

        for (cost, i, global_id) in candidates {
            let object = objects[i];
            let cameras = matched.entry(global_id).or_default();
            if assigned[i] || cameras.contains(&object.camera_id) {
                continue;
            }
            let Some(identity) = self.identities.get_mut(&global_id) else {
                continue;
            };
            assigned[i] = true;
            cameras.push(object.camera_id.clone());
            identity.observe(object);
            debug!(
                "identity {} matched {}#{} at cost {:.3}",
                global_id, object.camera_id, object.track_id, cost
            );
            associations.push(Association::Matched {
                global_id,
                object: ObjectKey::of(object),
            });
        }
    }

    /// Step 3: new cross-camera pairs, then single-camera identities.
    fn found_identities(
        &mut self,
        objects: &[&TrackedObject],
        assigned: &mut [bool],
        matched: &mut BTreeMap<u64, Vec<CameraId>>,
        associations: &mut Vec<Association>,
    ) -> HashSet<u64> {
        let model = CostModel::new(&self.settings, &self.calibration);
        let free: Vec<usize> = (0..objects.len()).filter(|&i| !assigned[i]).collect();

        let mut pairs: Vec<(f64, usize, usize)> = Vec::new();
        for (n, &i) in free.iter().enumerate() {
            for &j in &free[n + 1..] {
                // Orient each pair so the lower camera id comes first.
                let (a, b) = if objects[i].camera_id <= objects[j].camera_id {
                    (i, j)
                } else {
                    (j, i)
                };
                let cost = model.pair_cost(objects[a], objects[b]);
                if cost <= self.settings.pair_max_cost {
                    pairs.push((cost, a, b));
                }
            }
        }
        pairs.sort_by(|x, y| {
            x.0.total_cmp(&y.0)
                .then(objects[x.1].track_id.cmp(&objects[y.1].track_id))
                .then(objects[x.1].camera_id.cmp(&objects[y.1].camera_id))
                .then(objects[x.2].track_id.cmp(&objects[y.2].track_id))
                .then(objects[x.2].camera_id.cmp(&objects[y.2].camera_id))
        });

        let mut created = HashSet::new();
        for (_, a, b) in pairs {
            if assigned[a] || assigned[b] {
                continue;
            }
            assigned[a] = true;
            assigned[b] = true;
            let global_id = self.create(&[objects[a], objects[b]], matched);
            created.insert(global_id);
            associations.push(Association::NewCrossCameraPair {
                global_id,
                objects: [ObjectKey::of(objects[a]), ObjectKey::of(objects[b])],
            });
        }

        for i in free {
            if assigned[i] {
                continue;
            }
            assigned[i] = true;
            let global_id = self.create(&[objects[i]], matched);
            created.insert(global_id);
            associations.push(Association::Unmatched {
                global_id,
                object: ObjectKey::of(objects[i]),
            });
        }
        created
    }

    fn create(
        &mut self,
        objects: &[&TrackedObject],
        matched: &mut BTreeMap<u64, Vec<CameraId>>,
    ) -> u64 {
        let global_id = self.next_id;
        self.next_id += 1;
        let mut identity = GlobalIdentity::new(global_id);
        let cameras = matched.entry(global_id).or_default();
        for object in objects {
            identity.observe(object);
            cameras.push(object.camera_id.clone());
        }
        debug!(
            "identity {} created from {}",
            global_id,
            objects
                .iter()
                .map(|o| format!("{}#{}", o.camera_id, o.track_id))
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.identities.insert(global_id, identity);
        global_id
    }

    /// Step 4: advance counters, prune stale contributions, evict.
    fn age_and_evict(&mut self, matched: &BTreeMap<u64, Vec<CameraId>>, created: &HashSet<u64>) {
        let ttl = self.settings.ttl_cycles;
        let none: Vec<CameraId> = Vec::new();
        for (global_id, identity) in self.identities.iter_mut() {
            let cameras = matched.get(global_id).unwrap_or(&none);
            identity.age_by_one_cycle(cameras, created.contains(global_id), ttl);
        }
        self.identities.retain(|global_id, identity| {
            let keep = !identity.is_expired(ttl);
            if !keep {
                debug!(
                    "identity {} evicted after {} unmatched cycles",
                    global_id,
                    identity.cycles_since_match()
                );
            }
            keep
        });
    }

    /// Step 5: triangulate when two or more contributing cameras are
    /// calibrated; otherwise parallel stereo from the first two cameras by id.
    fn update_positions(&mut self) {
        let calibration = &self.calibration;
        for identity in self.identities.values_mut() {
            if identity.contributions().len() < 2 {
                continue;
            }

            let views: Vec<geometry::View<'_>> = identity
                .contributions()
                .iter()
                .filter_map(|(camera, c)| {
                    calibration.cameras.get(camera).map(|cal| {
                        let (x, y) = c.bbox.center();
                        geometry::View {
                            calibration: cal,
                            pixel: (f64::from(x), f64::from(y)),
                        }
                    })
                })
                .collect();

            let estimate = if views.len() >= 2 {
                geometry::triangulate(&views).map(|p| (p, true))
            } else {
                let mut boxes = identity.contributions().values().map(|c| {
                    let (x, y) = c.bbox.center();
                    (f64::from(x), f64::from(y))
                });
                match (boxes.next(), boxes.next()) {
                    (Some(left), Some(right)) => {
                        geometry::stereo_position(left, right, calibration).map(|p| (p, false))
                    }
                    _ => None,
                }
            };

            // A failed estimate keeps the last fused position.
            if let Some((position, triangulated)) = estimate {
                identity.set_position(position, triangulated);
            }
        }
    }
}

/// All objects of a cycle in deterministic order: camera id, then track id.
/// A camera listed twice or a repeated track id keeps only its first object.
fn flatten(observations: &[CameraObservations]) -> Vec<&TrackedObject> {
    let mut seen = HashSet::new();
    let mut objects: Vec<&TrackedObject> = Vec::new();
    for camera in observations {
        for object in &camera.objects {
            if object.camera_id != camera.camera_id {
                continue;
            }
            if seen.insert((object.camera_id.as_str(), object.track_id)) {
                objects.push(object);
            }
        }
    }
    objects.sort_by(|a, b| {
        a.camera_id
            .cmp(&b.camera_id)
            .then(a.track_id.cmp(&b.track_id))
    });
    objects
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoundingBox;

    fn person(camera: &str, track: u64, x: f32, y: f32) -> TrackedObject {
        TrackedObject::new(camera, track, BoundingBox::from_xywh(x, y, 40.0, 40.0), "person")
    }

    fn engine(ttl: u32) -> FusionEngine {
        let settings = FusionSettings {
            ttl_cycles: ttl,
            ..FusionSettings::default()
        };
        FusionEngine::new(settings, CalibrationSettings::default())
    }

    #[test]
    fn empty_input_is_not_an_error() {
        let mut engine = engine(3);
        let cycle = engine.run_cycle(&[]);
        assert_eq!(cycle.snapshot.cycle, 1);
        assert!(cycle.snapshot.is_empty());
        assert!(cycle.associations.is_empty());
    }

    #[test]
    fn track_continuity_beats_proximity() {
        let mut engine = engine(5);
        engine.run_cycle(&[CameraObservations::new("a", vec![person("a", 1, 0.0, 0.0)])]);
        engine.run_cycle(&[CameraObservations::new("a", vec![person("a", 2, 300.0, 0.0)])]);
        // Track 1 reappears far away next to a fresh track 3 sitting on its old spot.
        let cycle = engine.run_cycle(&[CameraObservations::new(
            "a",
            vec![person("a", 1, 500.0, 0.0), person("a", 3, 0.0, 0.0)],
        )]);
        let identity = engine.identity(1).unwrap();
        assert_eq!(identity.camera_map().get("a"), Some(&1));
        assert!(cycle.associations.contains(&Association::Matched {
            global_id: 1,
            object: ObjectKey {
                camera_id: "a".into(),
                track_id: 1
            },
        }));
    }

    #[test]
    fn equal_costs_prefer_smaller_track_id() {
        let mut engine = engine(5);
        engine.run_cycle(&[CameraObservations::new("a", vec![person("a", 1, 100.0, 0.0)])]);
        // Tracks 9 and 4 sit at the same distance on either side.
        let cycle = engine.run_cycle(&[CameraObservations::new(
            "a",
            vec![person("a", 9, 110.0, 0.0), person("a", 4, 90.0, 0.0)],
        )]);
        assert_eq!(engine.identity(1).unwrap().camera_map().get("a"), Some(&4));
        assert!(cycle
            .associations
            .iter()
            .any(|a| matches!(a, Association::Unmatched { object, .. } if object.track_id == 9)));
    }

    #[test]
    fn global_ids_are_never_reused() {
        let mut engine = engine(1);
        engine.run_cycle(&[CameraObservations::new("a", vec![person("a", 1, 0.0, 0.0)])]);
        engine.run_cycle(&[]);
        engine.run_cycle(&[]);
        assert!(engine.identity(1).is_none());
        engine.run_cycle(&[CameraObservations::new("a", vec![person("a", 1, 0.0, 0.0)])]);
        assert!(engine.identity(2).is_some());
    }

    #[test]
    fn third_camera_joins_existing_pair_next_cycle() {
        let mut engine = engine(5);
        let cycle = engine.run_cycle(&[
            CameraObservations::new("a", vec![person("a", 1, 100.0, 100.0)]),
            CameraObservations::new("b", vec![person("b", 1, 80.0, 100.0)]),
            CameraObservations::new("c", vec![person("c", 1, 60.0, 100.0)]),
        ]);
        assert_eq!(cycle.snapshot.identities.len(), 2);

        engine.run_cycle(&[
            CameraObservations::new("a", vec![person("a", 1, 100.0, 100.0)]),
            CameraObservations::new("b", vec![person("b", 1, 80.0, 100.0)]),
            CameraObservations::new("c", vec![person("c", 2, 60.0, 100.0)]),
        ]);
        let pair = engine.identity(1).unwrap();
        assert_eq!(pair.contributions().len(), 3);
    }
}
