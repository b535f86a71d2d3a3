use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::CameraId;

const DEFAULT_CAMERA_CONFIG_PATH: &str = "camera_config.json";
const DEFAULT_CAMERA_1_INDEX: u32 = 0;
const DEFAULT_CAMERA_2_INDEX: u32 = 1;

const DEFAULT_FAILURE_THRESHOLD: u32 = 10;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_READ_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_BACKOFF_INITIAL_MS: u64 = 1_000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
const DEFAULT_BACKOFF_JITTER: f64 = 0.1;
const DEFAULT_MIN_FPS: f64 = 0.0;
const DEFAULT_STOP_GRACE_MS: u64 = 2_000;

const DEFAULT_FUSION_PERIOD_MS: u64 = 33;
const DEFAULT_TTL_CYCLES: u32 = 30;
const DEFAULT_MAX_COST: f64 = 1.0;
const DEFAULT_DISTANCE_SCALE_PX: f64 = 100.0;
const DEFAULT_CLASS_MISMATCH_PENALTY: f64 = 0.75;
const DEFAULT_EMBEDDING_WEIGHT: f64 = 1.0;

const DEFAULT_BASELINE_M: f64 = 0.5;
const DEFAULT_FRAME_WIDTH: u32 = 640;
const DEFAULT_FRAME_HEIGHT: u32 = 480;
const DEFAULT_MIN_DISPARITY: f64 = 0.01;

// -------------------- Camera sources --------------------

/// How a camera is reached. Closed set: a camera is either a local device or a
/// stream address (network URL or file path).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Device(u32),
    Stream(String),
}

/// One configured camera. Immutable once built; reconfiguration replaces it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraSource {
    id: CameraId,
    name: String,
    kind: SourceKind,
    enabled: bool,
}

impl CameraSource {
    pub fn device(id: impl Into<String>, name: impl Into<String>, index: u32, enabled: bool) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: SourceKind::Device(index),
            enabled,
        }
    }

    /// Stream source. The URL is normalized: whitespace trimmed, and a bare
    /// `host:port/path` is treated as HTTP.
    pub fn stream(id: impl Into<String>, name: impl Into<String>, url: &str, enabled: bool) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: SourceKind::Stream(normalize_stream_url(url)),
            enabled,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &SourceKind {
        &self.kind
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Human-readable address for logs.
    pub fn address(&self) -> String {
        match &self.kind {
            SourceKind::Device(index) => format!("device:{}", index),
            SourceKind::Stream(url) => url.clone(),
        }
    }
}

fn normalize_stream_url(url: &str) -> String {
    let url = url.trim();
    if url.contains("://") || url.starts_with('/') || url.starts_with('.') {
        url.to_string()
    } else {
        format!("http://{}", url)
    }
}

/// A camera entry that could not be used. The camera is treated as disabled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigIssue {
    pub camera_id: CameraId,
    pub reason: String,
}

/// Result of reading the camera configuration file.
#[derive(Clone, Debug, Default)]
pub struct CameraSources {
    /// Every usable entry, enabled or not, ordered by camera id.
    pub sources: Vec<CameraSource>,
    /// Entries that were dropped, with the reason.
    pub issues: Vec<ConfigIssue>,
}

impl CameraSources {
    pub fn enabled(&self) -> impl Iterator<Item = &CameraSource> {
        self.sources.iter().filter(|source| source.enabled())
    }

    /// Two local devices, as used when no configuration file exists.
    pub fn defaults() -> Self {
        Self {
            sources: vec![
                CameraSource::device("camera1", "Camera 1", DEFAULT_CAMERA_1_INDEX, true),
                CameraSource::device("camera2", "Camera 2", DEFAULT_CAMERA_2_INDEX, true),
            ],
            issues: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CameraEntryFile {
    #[serde(rename = "type")]
    kind: Option<String>,
    device_index: Option<i64>,
    url: Option<String>,
    name: Option<String>,
    enabled: Option<bool>,
}

/// Read the per-camera configuration file.
///
/// Never fails: a missing file yields the two default devices, an unreadable or
/// non-object file yields the defaults plus an issue, and each malformed entry
/// is dropped (treated as disabled) with an issue naming the camera.
pub fn load_camera_sources(path: &Path) -> CameraSources {
    if !path.exists() {
        log::info!(
            "camera config {} not found, using default devices",
            path.display()
        );
        return CameraSources::defaults();
    }

    let parsed = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read camera config {}: {}", path.display(), e))
        .and_then(|raw| parse_camera_sources(&raw));
    match parsed {
        Ok(sources) => sources,
        Err(err) => {
            log::error!("{}; using default devices", err);
            let mut sources = CameraSources::defaults();
            sources.issues.push(ConfigIssue {
                camera_id: "*".to_string(),
                reason: err.to_string(),
            });
            sources
        }
    }
}

/// Parse the camera configuration JSON. Fails only when the document itself is
/// not a JSON object; individual entries never fail the parse.
pub fn parse_camera_sources(raw: &str) -> Result<CameraSources> {
    let document: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| anyhow!("invalid camera config: {}", e))?;
    let entries = document
        .as_object()
        .ok_or_else(|| anyhow!("camera config must be a JSON object keyed by camera id"))?;

    let ordered: BTreeMap<&String, &serde_json::Value> = entries.iter().collect();
    let mut out = CameraSources::default();
    for (camera_id, value) in ordered {
        match camera_from_entry(camera_id, value) {
            Ok(source) => {
                if !source.enabled() {
                    log::info!("camera {} is disabled", camera_id);
                }
                out.sources.push(source);
            }
            Err(err) => {
                log::warn!("camera {} omitted: {}", camera_id, err);
                out.issues.push(ConfigIssue {
                    camera_id: camera_id.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }
    Ok(out)
}

fn camera_from_entry(camera_id: &str, value: &serde_json::Value) -> Result<CameraSource> {
    let entry: CameraEntryFile = serde_json::from_value(value.clone())
        .map_err(|e| anyhow!("malformed entry: {}", e))?;
    let enabled = entry
        .enabled
        .ok_or_else(|| anyhow!("missing 'enabled' flag"))?;
    let name = entry
        .name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| camera_id.to_string());

    match entry.kind.as_deref() {
        Some("device") => {
            let index = entry
                .device_index
                .ok_or_else(|| anyhow!("device entry missing 'device_index'"))?;
            let index = u32::try_from(index)
                .map_err(|_| anyhow!("device_index {} is out of range", index))?;
            Ok(CameraSource::device(camera_id, name, index, enabled))
        }
        Some("url") => {
            let url = entry.url.unwrap_or_default();
            if url.trim().is_empty() {
                return Err(anyhow!("url entry has an empty 'url'"));
            }
            Ok(CameraSource::stream(camera_id, name, &url, enabled))
        }
        Some(other) => Err(anyhow!(
            "unknown camera type '{}'; expected 'device' or 'url'",
            other
        )),
        None => Err(anyhow!("missing camera 'type'")),
    }
}

// -------------------- Calibration --------------------

/// Pinhole calibration for one camera: intrinsics plus world-to-camera pose.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct CameraCalibration {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    #[serde(default = "identity_rotation")]
    pub rotation: [[f64; 3]; 3],
    #[serde(default)]
    pub translation: [f64; 3],
}

fn identity_rotation() -> [[f64; 3]; 3] {
    [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]
}

impl CameraCalibration {
    /// Camera with identity rotation, shifted along x by `offset_x` in world units.
    pub fn horizontal(fx: f64, fy: f64, cx: f64, cy: f64, offset_x: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            rotation: identity_rotation(),
            translation: [-offset_x, 0.0, 0.0],
        }
    }
}

/// Everything the fusion engine needs to turn boxes into positions.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationSettings {
    /// Calibrated cameras. Cameras without an entry use the stereo fallback.
    pub cameras: BTreeMap<CameraId, CameraCalibration>,
    /// Distance between the two cameras of the parallel-stereo fallback.
    pub baseline_m: f64,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Normalized disparity floor; bounds the fallback depth at
    /// `baseline_m / min_disparity`.
    pub min_disparity: f64,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            cameras: BTreeMap::new(),
            baseline_m: DEFAULT_BASELINE_M,
            frame_width: DEFAULT_FRAME_WIDTH,
            frame_height: DEFAULT_FRAME_HEIGHT,
            min_disparity: DEFAULT_MIN_DISPARITY,
        }
    }
}

// -------------------- Tuning --------------------

#[derive(Clone, Debug, PartialEq)]
pub struct WorkerSettings {
    /// Consecutive per-frame failures before the connection is torn down.
    pub failure_threshold: u32,
    pub connect_timeout: Duration,
    /// Per-attempt frame read timeout.
    pub read_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Fraction of the backoff delay added as random jitter (0 disables).
    pub backoff_jitter: f64,
    /// Frame rate below which a streaming camera is reported `Degraded`
    /// (0 disables rate-based degradation).
    pub min_fps: f64,
    /// How long `stop()` waits for the worker thread before abandoning it.
    pub stop_grace: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            backoff_initial: Duration::from_millis(DEFAULT_BACKOFF_INITIAL_MS),
            backoff_max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            backoff_jitter: DEFAULT_BACKOFF_JITTER,
            min_fps: DEFAULT_MIN_FPS,
            stop_grace: Duration::from_millis(DEFAULT_STOP_GRACE_MS),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FusionSettings {
    /// Fusion cadence, independent of camera frame rates.
    pub period: Duration,
    /// Cycles an identity (or one camera's contribution) survives unmatched.
    pub ttl_cycles: u32,
    /// Ceiling for re-associating an object with an existing identity.
    pub max_cost: f64,
    /// Ceiling for pairing two unmatched objects into a new identity.
    pub pair_max_cost: f64,
    /// Pixel distance that contributes a cost of 1.0.
    pub distance_scale_px: f64,
    pub class_mismatch_penalty: f64,
    /// Weight of the cosine distance between appearance embeddings.
    pub embedding_weight: f64,
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(DEFAULT_FUSION_PERIOD_MS),
            ttl_cycles: DEFAULT_TTL_CYCLES,
            max_cost: DEFAULT_MAX_COST,
            pair_max_cost: DEFAULT_MAX_COST,
            distance_scale_px: DEFAULT_DISTANCE_SCALE_PX,
            class_mismatch_penalty: DEFAULT_CLASS_MISMATCH_PENALTY,
            embedding_weight: DEFAULT_EMBEDDING_WEIGHT,
        }
    }
}

impl FusionSettings {
    pub fn validate(&self) -> Result<()> {
        if self.period.is_zero() {
            return Err(anyhow!("fusion period must be greater than zero"));
        }
        if self.ttl_cycles == 0 {
            return Err(anyhow!("fusion ttl_cycles must be at least 1"));
        }
        for (name, value) in [
            ("max_cost", self.max_cost),
            ("pair_max_cost", self.pair_max_cost),
            ("distance_scale_px", self.distance_scale_px),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(anyhow!("fusion {} must be finite and > 0", name));
            }
        }
        for (name, value) in [
            ("class_mismatch_penalty", self.class_mismatch_penalty),
            ("embedding_weight", self.embedding_weight),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(anyhow!("fusion {} must be finite and >= 0", name));
            }
        }
        Ok(())
    }
}

// -------------------- Daemon configuration --------------------

#[derive(Debug, Deserialize, Default)]
struct CamfusedConfigFile {
    camera_config: Option<PathBuf>,
    worker: Option<WorkerConfigFile>,
    fusion: Option<FusionConfigFile>,
    stereo: Option<StereoConfigFile>,
    calibration: Option<BTreeMap<CameraId, CameraCalibration>>,
}

#[derive(Debug, Deserialize, Default)]
struct WorkerConfigFile {
    failure_threshold: Option<u32>,
    connect_timeout_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
    backoff_initial_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    backoff_jitter: Option<f64>,
    min_fps: Option<f64>,
    stop_grace_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct FusionConfigFile {
    period_ms: Option<u64>,
    ttl_cycles: Option<u32>,
    max_cost: Option<f64>,
    pair_max_cost: Option<f64>,
    distance_scale_px: Option<f64>,
    class_mismatch_penalty: Option<f64>,
    embedding_weight: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct StereoConfigFile {
    baseline_m: Option<f64>,
    frame_width: Option<u32>,
    frame_height: Option<u32>,
    min_disparity: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CamfusedConfig {
    pub camera_config_path: PathBuf,
    pub worker: WorkerSettings,
    pub fusion: FusionSettings,
    pub calibration: CalibrationSettings,
}

impl CamfusedConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAMFUSE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CamfusedConfigFile) -> Self {
        let camera_config_path = file
            .camera_config
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CAMERA_CONFIG_PATH));

        let defaults = WorkerSettings::default();
        let w = file.worker.unwrap_or_default();
        let worker = WorkerSettings {
            failure_threshold: w.failure_threshold.unwrap_or(defaults.failure_threshold),
            connect_timeout: w
                .connect_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_timeout),
            read_timeout: w
                .read_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.read_timeout),
            backoff_initial: w
                .backoff_initial_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_initial),
            backoff_max: w
                .backoff_max_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_max),
            backoff_jitter: w.backoff_jitter.unwrap_or(defaults.backoff_jitter),
            min_fps: w.min_fps.unwrap_or(defaults.min_fps),
            stop_grace: w
                .stop_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.stop_grace),
        };

        let defaults = FusionSettings::default();
        let f = file.fusion.unwrap_or_default();
        let max_cost = f.max_cost.unwrap_or(defaults.max_cost);
        let fusion = FusionSettings {
            period: f
                .period_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.period),
            ttl_cycles: f.ttl_cycles.unwrap_or(defaults.ttl_cycles),
            max_cost,
            pair_max_cost: f.pair_max_cost.unwrap_or(max_cost),
            distance_scale_px: f.distance_scale_px.unwrap_or(defaults.distance_scale_px),
            class_mismatch_penalty: f
                .class_mismatch_penalty
                .unwrap_or(defaults.class_mismatch_penalty),
            embedding_weight: f.embedding_weight.unwrap_or(defaults.embedding_weight),
        };

        let defaults = CalibrationSettings::default();
        let s = file.stereo.unwrap_or_default();
        let calibration = CalibrationSettings {
            cameras: file.calibration.unwrap_or_default(),
            baseline_m: s.baseline_m.unwrap_or(defaults.baseline_m),
            frame_width: s.frame_width.unwrap_or(defaults.frame_width),
            frame_height: s.frame_height.unwrap_or(defaults.frame_height),
            min_disparity: s.min_disparity.unwrap_or(defaults.min_disparity),
        };

        Self {
            camera_config_path,
            worker,
            fusion,
            calibration,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("CAMFUSE_CAMERA_CONFIG") {
            if !path.trim().is_empty() {
                self.camera_config_path = PathBuf::from(path);
            }
        }
        if let Ok(period) = std::env::var("CAMFUSE_FUSION_PERIOD_MS") {
            let millis: u64 = period.parse().map_err(|_| {
                anyhow!("CAMFUSE_FUSION_PERIOD_MS must be an integer number of milliseconds")
            })?;
            self.fusion.period = Duration::from_millis(millis);
        }
        if let Ok(ttl) = std::env::var("CAMFUSE_TTL_CYCLES") {
            self.fusion.ttl_cycles = ttl
                .parse()
                .map_err(|_| anyhow!("CAMFUSE_TTL_CYCLES must be an integer number of cycles"))?;
        }
        if let Ok(cost) = std::env::var("CAMFUSE_MAX_COST") {
            self.fusion.max_cost = cost
                .parse()
                .map_err(|_| anyhow!("CAMFUSE_MAX_COST must be a number"))?;
        }
        if let Ok(threshold) = std::env::var("CAMFUSE_FAILURE_THRESHOLD") {
            self.worker.failure_threshold = threshold
                .parse()
                .map_err(|_| anyhow!("CAMFUSE_FAILURE_THRESHOLD must be an integer"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.fusion.validate()?;
        if self.worker.failure_threshold == 0 {
            return Err(anyhow!("worker failure_threshold must be at least 1"));
        }
        if self.worker.backoff_initial > self.worker.backoff_max {
            return Err(anyhow!(
                "worker backoff_initial_ms must not exceed backoff_max_ms"
            ));
        }
        if !(0.0..=1.0).contains(&self.worker.backoff_jitter) {
            return Err(anyhow!("worker backoff_jitter must be within 0..=1"));
        }
        if self.calibration.baseline_m <= 0.0 || self.calibration.min_disparity <= 0.0 {
            return Err(anyhow!("stereo baseline_m and min_disparity must be > 0"));
        }
        if self.calibration.frame_width == 0 || self.calibration.frame_height == 0 {
            return Err(anyhow!("stereo frame size must be non-zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<CamfusedConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
