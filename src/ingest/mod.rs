//! Frame ingestion backends and the seams the acquisition worker drives.
//!
//! A `Connector` opens a `CameraSource` with one `ConnectStrategy` and returns a
//! `FrameReader`. The worker walks the strategy list for the source kind in a
//! fixed order and keeps the first strategy that yields a decodable frame.
//!
//! Backends:
//! - Synthetic `stub://` source (always available; demos and tests)
//! - HTTP multipart MJPEG and single-JPEG snapshot (feature: ingest-http)
//! - RTSP via GStreamer (feature: rtsp-gstreamer)
//! - Generic FFmpeg open of a URL, file or device node (feature: ingest-ffmpeg)
//! - Local V4L2 devices (feature: ingest-v4l2)
//!
//! A strategy whose backend is not compiled in fails with
//! `CaptureError::Unsupported`, so the worker simply moves on to the next one.

use std::time::Duration;

use serde::Serialize;

use crate::config::{CameraSource, SourceKind};
use crate::error::CaptureError;

#[cfg(feature = "ingest-ffmpeg")]
mod ffmpeg;
#[cfg(feature = "ingest-http")]
mod http;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
#[cfg(feature = "rtsp-gstreamer")]
mod rtsp;
mod synthetic;
#[cfg(feature = "ingest-v4l2")]
mod v4l2;

pub use synthetic::SyntheticReader;

/// Upper bound on a single encoded JPEG, for both MJPEG parts and snapshots.
#[cfg_attr(not(feature = "ingest-http"), allow(dead_code))]
pub(crate) const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

/// Decoded image as produced by a reader: interleaved RGB8 at native size.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// One way of opening a source. Tried in the order given by `strategies_for`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectStrategy {
    /// Platform-native device API.
    NativeDevice,
    /// Protocol named by the URL scheme, trusting what the server declares.
    DirectProtocol,
    /// Protocol named by the URL scheme with the stream format forced.
    ForcedFormat,
    /// Generic open through FFmpeg, letting it probe the container.
    DefaultOpen,
    /// One HTTP request per frame on the derived snapshot endpoint.
    SnapshotRequest,
}

const DEVICE_STRATEGIES: &[ConnectStrategy] =
    &[ConnectStrategy::NativeDevice, ConnectStrategy::DefaultOpen];

const STREAM_STRATEGIES: &[ConnectStrategy] = &[
    ConnectStrategy::DirectProtocol,
    ConnectStrategy::ForcedFormat,
    ConnectStrategy::DefaultOpen,
    ConnectStrategy::SnapshotRequest,
];

impl ConnectStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NativeDevice => "native_device",
            Self::DirectProtocol => "direct_protocol",
            Self::ForcedFormat => "forced_format",
            Self::DefaultOpen => "default_open",
            Self::SnapshotRequest => "snapshot_request",
        }
    }
}

impl std::fmt::Display for ConnectStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Strategy list for a source kind, in the order they must be attempted.
pub fn strategies_for(kind: &SourceKind) -> &'static [ConnectStrategy] {
    match kind {
        SourceKind::Device(_) => DEVICE_STRATEGIES,
        SourceKind::Stream(_) => STREAM_STRATEGIES,
    }
}

/// Timeouts applied by a reader: `connect` while opening, `read` per frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub read: Duration,
}

/// An open connection that yields decoded frames. Readers are opened and
/// dropped on the worker thread, so they need not be `Send`.
pub trait FrameReader {
    /// Block for at most the reader's read timeout and return the next frame.
    fn read_frame(&mut self) -> Result<RawImage, CaptureError>;
}

/// Opens sources. The worker owns one connector for the lifetime of a camera.
pub trait Connector: Send {
    fn open(
        &mut self,
        source: &CameraSource,
        strategy: ConnectStrategy,
        timeouts: Timeouts,
    ) -> Result<Box<dyn FrameReader>, CaptureError>;
}

/// Open `source` with `strategy` and read the first frame.
///
/// A strategy only counts as connected once it has produced a decodable frame;
/// the probe frame is returned so it can be published.
pub fn open_with_probe(
    connector: &mut dyn Connector,
    source: &CameraSource,
    strategy: ConnectStrategy,
    timeouts: Timeouts,
) -> Result<(Box<dyn FrameReader>, RawImage), CaptureError> {
    let mut reader = connector.open(source, strategy, timeouts)?;
    let probe = reader.read_frame()?;
    Ok((reader, probe))
}

// ----------------------------------------------------------------------------
// SystemConnector: dispatch to the compiled-in backends
// ----------------------------------------------------------------------------

/// Connector backed by the real ingestion backends.
#[derive(Debug, Default)]
pub struct SystemConnector;

impl SystemConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for SystemConnector {
    fn open(
        &mut self,
        source: &CameraSource,
        strategy: ConnectStrategy,
        timeouts: Timeouts,
    ) -> Result<Box<dyn FrameReader>, CaptureError> {
        match source.kind() {
            SourceKind::Device(index) => open_device(*index, strategy, timeouts),
            SourceKind::Stream(url) => open_stream(url, strategy, timeouts),
        }
    }
}

fn open_device(
    index: u32,
    strategy: ConnectStrategy,
    timeouts: Timeouts,
) -> Result<Box<dyn FrameReader>, CaptureError> {
    let path = format!("/dev/video{}", index);
    match strategy {
        ConnectStrategy::NativeDevice => open_v4l2(&path, timeouts),
        ConnectStrategy::DefaultOpen => open_ffmpeg(&path, timeouts),
        other => Err(CaptureError::Unsupported(format!(
            "{} does not apply to device sources",
            other
        ))),
    }
}

fn open_stream(
    url: &str,
    strategy: ConnectStrategy,
    timeouts: Timeouts,
) -> Result<Box<dyn FrameReader>, CaptureError> {
    let scheme = url_scheme(url);
    match (strategy, scheme) {
        (ConnectStrategy::DirectProtocol, Some("stub")) => {
            Ok(Box::new(SyntheticReader::from_url(url)?))
        }
        (_, Some("stub")) => Err(CaptureError::Unsupported(format!(
            "{} does not apply to synthetic sources",
            strategy
        ))),
        (ConnectStrategy::DirectProtocol, Some("rtsp")) => open_rtsp(url, false, timeouts),
        (ConnectStrategy::ForcedFormat, Some("rtsp")) => open_rtsp(url, true, timeouts),
        (ConnectStrategy::DirectProtocol, Some("http" | "https")) => {
            open_mjpeg(url, false, timeouts)
        }
        (ConnectStrategy::ForcedFormat, Some("http" | "https")) => open_mjpeg(url, true, timeouts),
        (ConnectStrategy::DefaultOpen, _) => open_ffmpeg(url, timeouts),
        (ConnectStrategy::SnapshotRequest, Some("http" | "https")) => {
            let snapshot = snapshot_url(url).ok_or_else(|| {
                CaptureError::Unsupported(format!("no snapshot endpoint for {}", url))
            })?;
            open_snapshot(&snapshot, timeouts)
        }
        (strategy, scheme) => Err(CaptureError::Unsupported(format!(
            "{} does not apply to scheme {}",
            strategy,
            scheme.unwrap_or("<none>")
        ))),
    }
}

#[cfg(feature = "ingest-v4l2")]
fn open_v4l2(path: &str, timeouts: Timeouts) -> Result<Box<dyn FrameReader>, CaptureError> {
    Ok(Box::new(v4l2::V4l2Reader::open(path, timeouts)?))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_v4l2(_path: &str, _timeouts: Timeouts) -> Result<Box<dyn FrameReader>, CaptureError> {
    Err(CaptureError::Unsupported(
        "native device capture requires the ingest-v4l2 feature".to_string(),
    ))
}

#[cfg(feature = "ingest-ffmpeg")]
fn open_ffmpeg(target: &str, timeouts: Timeouts) -> Result<Box<dyn FrameReader>, CaptureError> {
    Ok(Box::new(ffmpeg::FfmpegReader::open(target, timeouts)?))
}

#[cfg(not(feature = "ingest-ffmpeg"))]
fn open_ffmpeg(_target: &str, _timeouts: Timeouts) -> Result<Box<dyn FrameReader>, CaptureError> {
    Err(CaptureError::Unsupported(
        "default open requires the ingest-ffmpeg feature".to_string(),
    ))
}

#[cfg(feature = "rtsp-gstreamer")]
fn open_rtsp(
    url: &str,
    force_tcp: bool,
    timeouts: Timeouts,
) -> Result<Box<dyn FrameReader>, CaptureError> {
    Ok(Box::new(rtsp::GstreamerReader::open(url, force_tcp, timeouts)?))
}

#[cfg(not(feature = "rtsp-gstreamer"))]
fn open_rtsp(
    _url: &str,
    _force_tcp: bool,
    _timeouts: Timeouts,
) -> Result<Box<dyn FrameReader>, CaptureError> {
    Err(CaptureError::Unsupported(
        "RTSP requires the rtsp-gstreamer feature".to_string(),
    ))
}

#[cfg(feature = "ingest-http")]
fn open_mjpeg(
    url: &str,
    forced: bool,
    timeouts: Timeouts,
) -> Result<Box<dyn FrameReader>, CaptureError> {
    Ok(Box::new(http::MjpegReader::open(url, forced, timeouts)?))
}

#[cfg(not(feature = "ingest-http"))]
fn open_mjpeg(
    _url: &str,
    _forced: bool,
    _timeouts: Timeouts,
) -> Result<Box<dyn FrameReader>, CaptureError> {
    Err(CaptureError::Unsupported(
        "HTTP MJPEG requires the ingest-http feature".to_string(),
    ))
}

#[cfg(feature = "ingest-http")]
fn open_snapshot(url: &str, timeouts: Timeouts) -> Result<Box<dyn FrameReader>, CaptureError> {
    Ok(Box::new(http::SnapshotReader::open(url, timeouts)?))
}

#[cfg(not(feature = "ingest-http"))]
fn open_snapshot(_url: &str, _timeouts: Timeouts) -> Result<Box<dyn FrameReader>, CaptureError> {
    Err(CaptureError::Unsupported(
        "snapshot requests require the ingest-http feature".to_string(),
    ))
}

// ----------------------------------------------------------------------------
// URL helpers
// ----------------------------------------------------------------------------

fn url_scheme(url: &str) -> Option<&str> {
    url.split_once("://").map(|(scheme, _)| scheme)
}

/// Derive the single-image endpoint of an HTTP camera URL.
///
/// Streaming endpoints (`/video`, `/videofeed`, `/stream`) are swapped for
/// `/shot.jpg`; an address with no path gets `/shot.jpg` appended; any other
/// path is kept. Returns `None` for non-HTTP URLs.
pub fn snapshot_url(url: &str) -> Option<String> {
    let url = url.trim();
    let (scheme, rest) = url.split_once("://").unwrap_or(("http", url));
    if scheme != "http" && scheme != "https" {
        return None;
    }
    let (authority, path_and_query) = match rest.find('/') {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };
    if authority.is_empty() {
        return None;
    }
    let (path, query) = match path_and_query.find('?') {
        Some(idx) => path_and_query.split_at(idx),
        None => (path_and_query, ""),
    };
    let path = path.trim_end_matches('/');

    let snapshot_path = if path.is_empty() {
        "/shot.jpg".to_string()
    } else if path.ends_with("/shot.jpg") {
        path.to_string()
    } else {
        match ["/videofeed", "/video", "/stream"]
            .iter()
            .find(|suffix| path.ends_with(*suffix))
        {
            Some(suffix) => format!("{}/shot.jpg", &path[..path.len() - suffix.len()]),
            None => path.to_string(),
        }
    };
    Some(format!("{}://{}{}{}", scheme, authority, snapshot_path, query))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn timeouts() -> Timeouts {
        Timeouts {
            connect: Duration::from_millis(200),
            read: Duration::from_millis(200),
        }
    }

    #[test]
    fn strategy_order_is_fixed_per_kind() {
        assert_eq!(
            strategies_for(&SourceKind::Device(0)),
            &[ConnectStrategy::NativeDevice, ConnectStrategy::DefaultOpen]
        );
        assert_eq!(
            strategies_for(&SourceKind::Stream("http://cam".into())),
            &[
                ConnectStrategy::DirectProtocol,
                ConnectStrategy::ForcedFormat,
                ConnectStrategy::DefaultOpen,
                ConnectStrategy::SnapshotRequest,
            ]
        );
    }

    #[test]
    fn snapshot_url_rewrites_stream_endpoints() {
        assert_eq!(
            snapshot_url("http://10.0.0.5:8080/video").as_deref(),
            Some("http://10.0.0.5:8080/shot.jpg")
        );
        assert_eq!(
            snapshot_url("http://10.0.0.5:8080/videofeed").as_deref(),
            Some("http://10.0.0.5:8080/shot.jpg")
        );
        assert_eq!(
            snapshot_url("https://cam.local/live/stream/").as_deref(),
            Some("https://cam.local/live/shot.jpg")
        );
        assert_eq!(
            snapshot_url("10.0.0.5:8080").as_deref(),
            Some("http://10.0.0.5:8080/shot.jpg")
        );
        assert_eq!(
            snapshot_url("http://10.0.0.5:8080/shot.jpg").as_deref(),
            Some("http://10.0.0.5:8080/shot.jpg")
        );
        assert_eq!(snapshot_url("rtsp://cam/live"), None);
    }

    #[test]
    fn stub_sources_only_open_directly() -> anyhow::Result<()> {
        let source = CameraSource::stream("camera1", "stub", "stub://front?size=8x6", true);
        let mut connector = SystemConnector::new();
        let (_reader, probe) = open_with_probe(
            &mut connector,
            &source,
            ConnectStrategy::DirectProtocol,
            timeouts(),
        )?;
        assert_eq!((probe.width, probe.height), (8, 6));

        let forced = connector.open(&source, ConnectStrategy::ForcedFormat, timeouts());
        assert!(matches!(forced, Err(CaptureError::Unsupported(_))));
        Ok(())
    }

    #[test]
    fn device_rejects_stream_strategies() {
        let source = CameraSource::device("camera1", "desk", 0, true);
        let mut connector = SystemConnector::new();
        let result = connector.open(&source, ConnectStrategy::SnapshotRequest, timeouts());
        assert!(matches!(result, Err(CaptureError::Unsupported(_))));
    }
}
