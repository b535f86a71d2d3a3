use std::collections::BTreeMap;

use camfuse::config::{CalibrationSettings, CameraCalibration, FusionSettings};
use camfuse::detect::TrackedObject;
use camfuse::fusion::{Association, CameraObservations, FusedSnapshot, FusionEngine};
use camfuse::BoundingBox;

fn person(camera: &str, track: u64, bbox: BoundingBox) -> TrackedObject {
    TrackedObject::new(camera, track, bbox, "person").with_confidence(0.8)
}

fn engine_with_ttl(ttl: u32) -> FusionEngine {
    let settings = FusionSettings {
        ttl_cycles: ttl,
        ..FusionSettings::default()
    };
    FusionEngine::new(settings, CalibrationSettings::default())
}

fn scenario_pair() -> Vec<CameraObservations> {
    vec![
        CameraObservations::new(
            "A",
            vec![person("A", 7, BoundingBox::new(10.0, 10.0, 50.0, 50.0))],
        ),
        CameraObservations::new(
            "B",
            vec![person("B", 3, BoundingBox::new(12.0, 11.0, 49.0, 51.0))],
        ),
    ]
}

fn assert_positions_need_two_cameras(snapshot: &FusedSnapshot) {
    for identity in &snapshot.identities {
        if identity.position.is_some() {
            assert!(
                identity.cameras.len() >= 2,
                "identity {} has a position with one camera",
                identity.global_id
            );
        }
    }
}

#[test]
fn nearby_objects_in_two_cameras_fuse_with_position() {
    let mut engine = engine_with_ttl(30);
    let cycle = engine.run_cycle(&scenario_pair());

    assert_eq!(cycle.snapshot.identities.len(), 1);
    let identity = &cycle.snapshot.identities[0];
    let expected: BTreeMap<String, u64> = [("A".to_string(), 7), ("B".to_string(), 3)].into();
    assert_eq!(identity.camera_map(), expected);
    assert_eq!(identity.class_label, "person");
    let position = identity.position.expect("fused identity has a position");
    assert!(position.is_finite());
    assert!(matches!(
        cycle.associations.as_slice(),
        [Association::NewCrossCameraPair { global_id: 1, .. }]
    ));

    // The same tracks keep the same identity.
    let next = engine.run_cycle(&scenario_pair());
    assert_eq!(next.snapshot.identities.len(), 1);
    assert_eq!(next.snapshot.identities[0].global_id, 1);
    assert_eq!(next.snapshot.identities[0].age, 1);
}

#[test]
fn objects_outside_tolerance_stay_separate() {
    let mut engine = engine_with_ttl(30);
    let cycle = engine.run_cycle(&[
        CameraObservations::new(
            "A",
            vec![person("A", 7, BoundingBox::new(10.0, 10.0, 50.0, 50.0))],
        ),
        CameraObservations::new(
            "B",
            vec![person("B", 3, BoundingBox::new(12.0, 311.0, 49.0, 351.0))],
        ),
    ]);

    assert_eq!(cycle.snapshot.identities.len(), 2);
    assert!(cycle.snapshot.identities.iter().all(|i| i.position.is_none()));
    assert!(cycle
        .associations
        .iter()
        .all(|a| matches!(a, Association::Unmatched { .. })));
}

#[test]
fn pair_ceiling_is_configurable() {
    let settings = FusionSettings {
        pair_max_cost: 0.005,
        ..FusionSettings::default()
    };
    let mut engine = FusionEngine::new(settings, CalibrationSettings::default());
    let cycle = engine.run_cycle(&scenario_pair());
    assert_eq!(cycle.snapshot.identities.len(), 2);
}

#[test]
fn single_camera_identity_evicted_right_after_ttl() {
    let ttl = 3;
    let mut engine = engine_with_ttl(ttl);
    engine.run_cycle(&[CameraObservations::new(
        "A",
        vec![person("A", 1, BoundingBox::new(0.0, 0.0, 40.0, 40.0))],
    )]);

    for unmatched in 1..=ttl {
        let cycle = engine.run_cycle(&[]);
        let identity = cycle.snapshot.identity(1).expect("still within ttl");
        assert_eq!(identity.cycles_since_match, unmatched);
    }
    let cycle = engine.run_cycle(&[]);
    assert!(cycle.snapshot.identity(1).is_none());
    assert!(cycle.snapshot.is_empty());
}

#[test]
fn position_clears_when_second_camera_goes_quiet() {
    let ttl = 2;
    let mut engine = engine_with_ttl(ttl);
    let first = engine.run_cycle(&scenario_pair());
    assert!(first.snapshot.identities[0].position.is_some());

    let only_a = vec![CameraObservations::new(
        "A",
        vec![person("A", 7, BoundingBox::new(10.0, 10.0, 50.0, 50.0))],
    )];
    for _ in 0..ttl {
        let cycle = engine.run_cycle(&only_a);
        assert_positions_need_two_cameras(&cycle.snapshot);
        assert!(cycle.snapshot.identity(1).unwrap().position.is_some());
    }

    let cycle = engine.run_cycle(&only_a);
    let identity = cycle.snapshot.identity(1).expect("camera A keeps it alive");
    assert_eq!(identity.camera_map().len(), 1);
    assert!(identity.position.is_none());
}

#[test]
fn missing_camera_is_not_an_error() {
    let mut engine = engine_with_ttl(30);
    engine.run_cycle(&scenario_pair());
    // Neither camera produced a fresh frame this cycle.
    let cycle = engine.run_cycle(&[]);
    let identity = cycle.snapshot.identity(1).unwrap();
    assert_eq!(identity.cycles_since_match, 1);
    assert!(identity.position.is_some());
    assert!(cycle.associations.is_empty());
}

#[test]
fn single_camera_pipeline_yields_undefined_positions() {
    let mut engine = engine_with_ttl(30);
    for _ in 0..5 {
        let cycle = engine.run_cycle(&[CameraObservations::new(
            "camera1",
            vec![
                person("camera1", 1, BoundingBox::new(10.0, 10.0, 50.0, 50.0)),
                person("camera1", 2, BoundingBox::new(300.0, 10.0, 340.0, 50.0)),
            ],
        )]);
        assert_eq!(cycle.snapshot.identities.len(), 2);
        assert!(cycle.snapshot.identities.iter().all(|i| i.position.is_none()));
    }
}

#[test]
fn calibrated_cameras_triangulate() {
    let mut calibration = CalibrationSettings::default();
    calibration.cameras.insert(
        "left".into(),
        CameraCalibration::horizontal(500.0, 500.0, 320.0, 240.0, 0.0),
    );
    calibration.cameras.insert(
        "right".into(),
        CameraCalibration::horizontal(500.0, 500.0, 320.0, 240.0, 0.5),
    );
    let mut engine = FusionEngine::new(FusionSettings::default(), calibration);

    // World point (0.2, 0.1, 4.0) projects to (345, 252.5) and (282.5, 252.5).
    let around = |cx: f32, cy: f32| BoundingBox::new(cx - 20.0, cy - 20.0, cx + 20.0, cy + 20.0);
    let cycle = engine.run_cycle(&[
        CameraObservations::new("left", vec![person("left", 1, around(345.0, 252.5))]),
        CameraObservations::new("right", vec![person("right", 1, around(282.5, 252.5))]),
    ]);

    assert_eq!(cycle.snapshot.identities.len(), 1);
    let position = cycle.snapshot.identities[0].position.unwrap();
    assert!((position.x - 0.2).abs() < 1e-3, "x = {}", position.x);
    assert!((position.y - 0.1).abs() < 1e-3, "y = {}", position.y);
    assert!((position.z - 4.0).abs() < 1e-3, "z = {}", position.z);
}

#[test]
fn class_flicker_does_not_split_identity() {
    let mut engine = engine_with_ttl(30);
    engine.run_cycle(&scenario_pair());
    let cycle = engine.run_cycle(&[CameraObservations::new(
        "A",
        vec![TrackedObject::new(
            "A",
            8,
            BoundingBox::new(11.0, 10.0, 51.0, 50.0),
            "car",
        )],
    )]);
    let identity = cycle.snapshot.identity(1).unwrap();
    assert_eq!(identity.camera_map().get("A"), Some(&8));
    assert_eq!(cycle.snapshot.identities.len(), 1);
}
