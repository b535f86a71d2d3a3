//! camfused - multi-camera fusion daemon
//!
//! This daemon:
//! 1. Loads the camera configuration (defaults to two local devices)
//! 2. Starts one acquisition worker per enabled camera
//! 3. Runs detection, per-camera tracking and cross-camera fusion on a fixed cadence
//! 4. Emits one fused snapshot per cycle (log summary or JSON lines on stdout)
//! 5. Stops every worker on Ctrl-C

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use crossbeam_channel::RecvTimeoutError;
use std::path::PathBuf;
use std::time::Duration;

use camfuse::config::CamfusedConfig;
use camfuse::detect::{ColorMarkerDetector, DetectionAdapter, IouTracker, StubDetector};
use camfuse::pipeline::{JsonLinesSink, LogSink, Pipeline, Sink};
use camfuse::{load_camera_sources, StopOutcome};

const DEFAULT_N_INIT: u32 = 3;
const DEFAULT_MAX_AGE: u32 = 30;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DetectorKind {
    /// No detections; cameras are acquired but nothing is fused.
    Stub,
    /// Solid red marker (matches the synthetic `stub://` scene).
    Marker,
    /// YOLOv8 ONNX model (requires the backend-tract feature and --model).
    Yolo,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputKind {
    Log,
    Json,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-camera acquisition and cross-camera fusion daemon")]
struct Args {
    /// Camera configuration file (JSON object keyed by camera id).
    #[arg(long, env = "CAMFUSE_CAMERA_CONFIG")]
    camera_config: Option<PathBuf>,

    /// Detector run on every fresh frame.
    #[arg(long, env = "CAMFUSE_DETECTOR", value_enum, default_value = "stub")]
    detector: DetectorKind,

    /// ONNX model path for the yolo detector.
    #[arg(long, env = "CAMFUSE_MODEL")]
    model: Option<PathBuf>,

    /// Comma-separated class names the yolo detector reports.
    #[arg(long, env = "CAMFUSE_CLASSES", default_value = "car")]
    classes: String,

    /// Frames a new per-camera track needs before it is reported.
    #[arg(long, default_value_t = DEFAULT_N_INIT)]
    n_init: u32,

    /// Frames a confirmed per-camera track may go unseen.
    #[arg(long, default_value_t = DEFAULT_MAX_AGE)]
    max_age: u32,

    /// Snapshot output.
    #[arg(long, env = "CAMFUSE_OUTPUT", value_enum, default_value = "log")]
    output: OutputKind,

    /// Seconds between camera status log lines (0 disables).
    #[arg(long, default_value_t = 10)]
    status_interval_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = CamfusedConfig::load()?;
    if let Some(path) = &args.camera_config {
        config.camera_config_path = path.clone();
    }

    let cameras = load_camera_sources(&config.camera_config_path);
    for issue in &cameras.issues {
        log::warn!("camera {} omitted: {}", issue.camera_id, issue.reason);
    }
    for source in &cameras.sources {
        log::info!(
            "camera {} ({}): {} [{}]",
            source.id(),
            source.name(),
            source.address(),
            if source.enabled() { "enabled" } else { "disabled" }
        );
    }

    let detector = args.detector;
    let model = args.model.clone();
    let classes: Vec<String> = args
        .classes
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();
    // Fail before any camera starts if the detector cannot be built.
    build_detector(detector, model.as_ref(), &classes)?;

    let sink: Box<dyn Sink> = match args.output {
        OutputKind::Log => Box::new(LogSink::default()),
        OutputKind::Json => Box::new(JsonLinesSink::new(std::io::stdout())),
    };

    let (n_init, max_age) = (args.n_init, args.max_age);
    let pipeline = Pipeline::builder(cameras.sources)
        .worker_settings(config.worker.clone())
        .fusion_settings(config.fusion.clone())
        .calibration(config.calibration.clone())
        .detector(move |source| match build_detector(detector, model.as_ref(), &classes) {
            Ok(detector) => detector,
            Err(err) => {
                log::error!("camera {}: detector unavailable: {:#}", source.id(), err);
                Box::new(StubDetector)
            }
        })
        .tracker(move |_| Box::new(IouTracker::new(n_init, max_age)))
        .start(sink)?;
    log::info!("camfused running with cameras {:?}", pipeline.cameras());

    let (tx, rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    })
    .context("set Ctrl-C handler")?;

    let status_interval = match args.status_interval_secs {
        0 => Duration::MAX,
        secs => Duration::from_secs(secs),
    };
    loop {
        match rx.recv_timeout(status_interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                for status in pipeline.status() {
                    log::info!(
                        "camera {}: {:?} frames={} failures={} reconnects={} strategy={} fps={}",
                        status.camera_id,
                        status.state,
                        status.frames_captured,
                        status.consecutive_failures,
                        status.reconnects,
                        status
                            .active_strategy
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| "-".into()),
                        status
                            .fps
                            .map(|fps| format!("{:.1}", fps))
                            .unwrap_or_else(|| "-".into())
                    );
                }
            }
        }
    }

    log::info!("shutdown signal received, stopping cameras...");
    for (camera_id, outcome) in pipeline.stop() {
        if outcome == StopOutcome::Abandoned {
            log::warn!("camera {}: connection abandoned", camera_id);
        }
    }
    Ok(())
}

fn build_detector(
    kind: DetectorKind,
    model: Option<&PathBuf>,
    classes: &[String],
) -> Result<Box<dyn DetectionAdapter>> {
    match kind {
        DetectorKind::Stub => Ok(Box::new(StubDetector)),
        DetectorKind::Marker => Ok(Box::new(ColorMarkerDetector::synthetic_marker())),
        DetectorKind::Yolo => build_yolo(model, classes),
    }
}

#[cfg(feature = "backend-tract")]
fn build_yolo(model: Option<&PathBuf>, classes: &[String]) -> Result<Box<dyn DetectionAdapter>> {
    let path = model.ok_or_else(|| anyhow!("--model is required for the yolo detector"))?;
    let detector = camfuse::detect::YoloDetector::new(path)?.with_allowed_classes(classes.to_vec());
    Ok(Box::new(detector))
}

#[cfg(not(feature = "backend-tract"))]
fn build_yolo(_model: Option<&PathBuf>, _classes: &[String]) -> Result<Box<dyn DetectionAdapter>> {
    Err(anyhow!(
        "the yolo detector requires building with --features backend-tract"
    ))
}
