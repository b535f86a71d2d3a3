//! HTTP camera readers.
//!
//! - `MjpegReader`: one long-lived request, JPEG parts cut out of a
//!   multipart/x-mixed-replace body. In declared mode the server must announce
//!   a multipart content type; in forced mode the body is scanned for JPEG
//!   markers whatever the header says.
//! - `SnapshotReader`: one GET per frame against a single-image endpoint
//!   (e.g. `/shot.jpg`), the most reliable path for phone-based IP webcams.

use std::io::Read;

use anyhow::{anyhow, Context};
use image::GenericImageView;
use url::Url;

use super::{FrameReader, RawImage, Timeouts, MAX_JPEG_BYTES};
use crate::error::CaptureError;

const READ_CHUNK_BYTES: usize = 8192;

fn build_agent(timeouts: Timeouts) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(timeouts.connect)
        .timeout_read(timeouts.read)
        .build()
}

fn parse_http_url(url: &str) -> Result<Url, CaptureError> {
    let parsed = Url::parse(url)
        .with_context(|| format!("parse camera url {}", url))
        .map_err(CaptureError::connection)?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(CaptureError::Unsupported(format!(
            "scheme '{}' is not HTTP",
            other
        ))),
    }
}

// ----------------------------------------------------------------------------
// MJPEG stream
// ----------------------------------------------------------------------------

pub(crate) struct MjpegReader {
    stream: MjpegStream,
    read_timeout: std::time::Duration,
}

impl MjpegReader {
    pub(crate) fn open(url: &str, forced: bool, timeouts: Timeouts) -> Result<Self, CaptureError> {
        let url = parse_http_url(url)?;
        let response = build_agent(timeouts)
            .get(url.as_str())
            .call()
            .with_context(|| format!("connect to mjpeg stream {}", url))
            .map_err(CaptureError::connection)?;

        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        if !forced && !content_type.contains("multipart") {
            return Err(CaptureError::Connection(format!(
                "{} declared '{}', not a multipart stream",
                url, content_type
            )));
        }

        log::info!(
            "MjpegReader: connected to {} ({})",
            url,
            if forced { "forced" } else { "declared" }
        );
        Ok(Self {
            stream: MjpegStream::new(response.into_reader()),
            read_timeout: timeouts.read,
        })
    }
}

impl FrameReader for MjpegReader {
    fn read_frame(&mut self) -> Result<RawImage, CaptureError> {
        let jpeg = self.stream.read_next_jpeg(self.read_timeout)?;
        decode_jpeg(&jpeg)
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self, timeout: std::time::Duration) -> Result<Vec<u8>, CaptureError> {
        let mut chunk = vec![0u8; READ_CHUNK_BYTES];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = match self.reader.read(&mut chunk) {
                Ok(read) => read,
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                    ) =>
                {
                    return Err(CaptureError::Timeout(timeout));
                }
                Err(err) => {
                    return Err(CaptureError::connection(
                        anyhow::Error::new(err).context("read mjpeg chunk"),
                    ))
                }
            };
            if read == 0 {
                return Err(CaptureError::EndOfStream);
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                // No complete JPEG in a buffer this large: drop everything but
                // the tail so a split start marker can still be found.
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
                return Err(CaptureError::Decode(
                    "mjpeg part exceeded maximum jpeg size".to_string(),
                ));
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Snapshot polling
// ----------------------------------------------------------------------------

pub(crate) struct SnapshotReader {
    agent: ureq::Agent,
    url: Url,
    read_timeout: std::time::Duration,
}

impl SnapshotReader {
    pub(crate) fn open(url: &str, timeouts: Timeouts) -> Result<Self, CaptureError> {
        let url = parse_http_url(url)?;
        log::info!("SnapshotReader: polling {}", url);
        Ok(Self {
            agent: build_agent(timeouts),
            url,
            read_timeout: timeouts.read,
        })
    }

    fn fetch(&self) -> Result<Vec<u8>, CaptureError> {
        let response = match self.agent.get(self.url.as_str()).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                return Err(CaptureError::Decode(format!(
                    "snapshot {} returned HTTP {}",
                    self.url, code
                )))
            }
            Err(ureq::Error::Transport(transport))
                if matches!(transport.kind(), ureq::ErrorKind::Io) =>
            {
                log::debug!("snapshot {} transport error: {}", self.url, transport);
                return Err(CaptureError::Timeout(self.read_timeout));
            }
            Err(err) => {
                return Err(CaptureError::connection(
                    anyhow::Error::new(err).context(format!("fetch snapshot {}", self.url)),
                ))
            }
        };

        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_JPEG_BYTES as u64 + 1)
            .read_to_end(&mut bytes)
            .context("read snapshot body")
            .map_err(CaptureError::decode)?;
        if bytes.is_empty() {
            return Err(CaptureError::Decode("empty jpeg snapshot".to_string()));
        }
        if bytes.len() > MAX_JPEG_BYTES {
            return Err(CaptureError::Decode(
                "snapshot exceeded maximum jpeg size".to_string(),
            ));
        }
        Ok(bytes)
    }
}

impl FrameReader for SnapshotReader {
    fn read_frame(&mut self) -> Result<RawImage, CaptureError> {
        let jpeg = self.fetch()?;
        decode_jpeg(&jpeg)
    }
}

// ----------------------------------------------------------------------------
// JPEG helpers
// ----------------------------------------------------------------------------

fn decode_jpeg(bytes: &[u8]) -> Result<RawImage, CaptureError> {
    let image = image::load_from_memory(bytes)
        .context("decode jpeg")
        .map_err(CaptureError::decode)?;
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(CaptureError::decode(anyhow!("jpeg has zero size")));
    }
    let rgb = image.into_rgb8();
    Ok(RawImage {
        pixels: rgb.into_raw(),
        width,
        height,
    })
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = walk_segments(buffer, start + 2)?;
    Some((start, end))
}

/// Follow marker segment lengths from `pos` so an end marker embedded in a
/// metadata segment (an EXIF thumbnail) is not taken as the end of the image.
/// Returns the offset just past the real EOI.
fn walk_segments(buffer: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        if *buffer.get(pos)? != 0xFF {
            // Not a marker stream; fall back to the first end marker.
            return scan_for_eoi(buffer, pos);
        }
        while *buffer.get(pos + 1)? == 0xFF {
            pos += 1;
        }
        match buffer[pos + 1] {
            0xD9 => return Some(pos + 2),
            0x01 | 0xD0..=0xD7 => pos += 2,
            marker => {
                let len = usize::from(u16::from_be_bytes([*buffer.get(pos + 2)?, *buffer.get(pos + 3)?]));
                if len < 2 {
                    return scan_for_eoi(buffer, pos + 2);
                }
                pos += 2 + len;
                if marker == 0xDA {
                    pos = next_marker_after_scan(buffer, pos)?;
                }
            }
        }
    }
}

/// Skip entropy-coded data: stuffed `FF00` and restart markers belong to it.
fn next_marker_after_scan(buffer: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let offset = buffer.get(pos..)?.iter().position(|&b| b == 0xFF)?;
        pos += offset;
        match *buffer.get(pos + 1)? {
            0x00 | 0xD0..=0xD7 | 0xFF => pos += 1,
            _ => return Some(pos),
        }
    }
}

fn scan_for_eoi(buffer: &[u8], pos: usize) -> Option<usize> {
    let end = buffer.get(pos..)?.windows(2).position(|w| w == [0xFF, 0xD9])?;
    Some(pos + end + 2)
}
