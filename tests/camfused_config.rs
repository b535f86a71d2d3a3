use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use camfuse::config::{load_camera_sources, CamfusedConfig, SourceKind};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CAMFUSE_CONFIG",
        "CAMFUSE_CAMERA_CONFIG",
        "CAMFUSE_FUSION_PERIOD_MS",
        "CAMFUSE_TTL_CYCLES",
        "CAMFUSE_MAX_COST",
        "CAMFUSE_FAILURE_THRESHOLD",
    ] {
        std::env::remove_var(key);
    }
}

fn write_temp(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    std::io::Write::write_all(&mut file, contents.as_bytes()).expect("write temp file");
    file
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_temp(
        r#"{
            "camera_config": "/etc/camfuse/cameras.json",
            "worker": {
                "failure_threshold": 4,
                "connect_timeout_ms": 3000,
                "read_timeout_ms": 750,
                "backoff_initial_ms": 500,
                "backoff_max_ms": 8000
            },
            "fusion": {
                "period_ms": 50,
                "ttl_cycles": 12,
                "max_cost": 2.5,
                "class_mismatch_penalty": 0.5
            },
            "stereo": {
                "baseline_m": 0.3,
                "frame_width": 1280,
                "frame_height": 720
            },
            "calibration": {
                "camera1": {"fx": 800.0, "fy": 800.0, "cx": 640.0, "cy": 360.0},
                "camera2": {"fx": 800.0, "fy": 800.0, "cx": 640.0, "cy": 360.0,
                            "translation": [-0.3, 0.0, 0.0]}
            }
        }"#,
    );

    std::env::set_var("CAMFUSE_CONFIG", file.path());
    std::env::set_var("CAMFUSE_TTL_CYCLES", "20");
    std::env::set_var("CAMFUSE_FAILURE_THRESHOLD", "6");

    let cfg = CamfusedConfig::load().expect("load config");

    assert_eq!(cfg.camera_config_path.to_str(), Some("/etc/camfuse/cameras.json"));
    assert_eq!(cfg.worker.failure_threshold, 6);
    assert_eq!(cfg.worker.connect_timeout, Duration::from_millis(3000));
    assert_eq!(cfg.worker.read_timeout, Duration::from_millis(750));
    assert_eq!(cfg.worker.backoff_initial, Duration::from_millis(500));
    assert_eq!(cfg.worker.backoff_max, Duration::from_secs(8));
    assert_eq!(cfg.fusion.period, Duration::from_millis(50));
    assert_eq!(cfg.fusion.ttl_cycles, 20);
    assert_eq!(cfg.fusion.max_cost, 2.5);
    assert_eq!(cfg.fusion.pair_max_cost, 2.5);
    assert_eq!(cfg.fusion.class_mismatch_penalty, 0.5);
    assert_eq!(cfg.calibration.baseline_m, 0.3);
    assert_eq!(cfg.calibration.frame_width, 1280);
    assert_eq!(cfg.calibration.cameras.len(), 2);
    assert_eq!(cfg.calibration.cameras["camera2"].translation, [-0.3, 0.0, 0.0]);
    assert_eq!(cfg.calibration.cameras["camera1"].rotation[1], [0.0, 1.0, 0.0]);

    clear_env();
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = CamfusedConfig::load().expect("load defaults");
    assert_eq!(cfg.camera_config_path.to_str(), Some("camera_config.json"));
    assert_eq!(cfg.worker.failure_threshold, 10);
    assert_eq!(cfg.fusion.ttl_cycles, 30);
    assert_eq!(cfg.calibration.baseline_m, 0.5);
    assert_eq!((cfg.calibration.frame_width, cfg.calibration.frame_height), (640, 480));
    assert!(cfg.calibration.cameras.is_empty());

    clear_env();
}

#[test]
fn rejects_invalid_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CAMFUSE_TTL_CYCLES", "0");
    assert!(CamfusedConfig::load().is_err());
    std::env::set_var("CAMFUSE_TTL_CYCLES", "many");
    assert!(CamfusedConfig::load().is_err());
    clear_env();

    std::env::set_var("CAMFUSE_MAX_COST", "-1");
    assert!(CamfusedConfig::load().is_err());
    clear_env();

    let file = write_temp(r#"{"worker": {"backoff_initial_ms": 9000, "backoff_max_ms": 1000}}"#);
    std::env::set_var("CAMFUSE_CONFIG", file.path());
    assert!(CamfusedConfig::load().is_err());

    clear_env();
}

#[test]
fn camera_config_disabled_and_malformed_entries() {
    let file = write_temp(
        r#"{
            "camera1": {"type": "device", "device_index": 0, "name": "Desk", "enabled": true},
            "camera2": {"type": "url", "url": "192.168.1.50:8080/video", "name": "Phone", "enabled": false},
            "camera3": {"type": "device", "device_index": -1, "enabled": true},
            "camera4": {"type": "usb", "enabled": true},
            "camera5": {"type": "url", "url": "  ", "enabled": true},
            "camera6": {"type": "device", "device_index": 2}
        }"#,
    );

    let cameras = load_camera_sources(file.path());
    let ids: Vec<&str> = cameras.sources.iter().map(|s| s.id()).collect();
    assert_eq!(ids, vec!["camera1", "camera2"]);
    let enabled: Vec<&str> = cameras.enabled().map(|s| s.id()).collect();
    assert_eq!(enabled, vec!["camera1"]);
    assert_eq!(
        cameras.sources[1].kind(),
        &SourceKind::Stream("http://192.168.1.50:8080/video".to_string())
    );

    let omitted: Vec<&str> = cameras.issues.iter().map(|i| i.camera_id.as_str()).collect();
    assert_eq!(omitted, vec!["camera3", "camera4", "camera5", "camera6"]);
}

#[test]
fn missing_or_broken_camera_config_falls_back_to_two_devices() {
    let dir = tempfile::tempdir().expect("temp dir");
    let missing = load_camera_sources(&dir.path().join("absent.json"));
    assert!(missing.issues.is_empty());
    assert_eq!(missing.sources.len(), 2);
    assert_eq!(missing.sources[0].kind(), &SourceKind::Device(0));
    assert_eq!(missing.sources[1].kind(), &SourceKind::Device(1));

    let broken = write_temp("[1, 2, 3]");
    let fallback = load_camera_sources(broken.path());
    assert_eq!(fallback.sources.len(), 2);
    assert_eq!(fallback.issues.len(), 1);
    assert_eq!(fallback.issues[0].camera_id, "*");
}
