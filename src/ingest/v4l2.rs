//! Local V4L2 device reader (`/dev/videoN`).
//!
//! Asks the driver for packed RGB and accepts NV12 or YUYV when the device
//! refuses, converting to RGB8 on the way out. The device keeps its native
//! resolution.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{FrameReader, RawImage, Timeouts};
use crate::error::CaptureError;

const CAPTURE_BUFFERS: u32 = 4;

pub(crate) struct V4l2Reader {
    path: String,
    state: V4l2State,
    width: u32,
    height: u32,
    format: PixelFormat,
    read_timeout: std::time::Duration,
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Reader {
    pub(crate) fn open(path: &str, timeouts: Timeouts) -> Result<Self, CaptureError> {
        let reader = Self::build(path, timeouts).map_err(|err| {
            if err.is::<UnsupportedFormat>() {
                CaptureError::Unsupported(format!("{:#}", err))
            } else {
                CaptureError::connection(err)
            }
        })?;
        log::info!(
            "V4l2Reader: connected to {} ({}x{} {:?})",
            reader.path,
            reader.width,
            reader.height,
            reader.format
        );
        Ok(reader)
    }

    fn build(path: &str, timeouts: Timeouts) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let device =
            v4l::Device::with_path(path).with_context(|| format!("open v4l2 device {}", path))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("V4l2Reader: failed to request RGB on {}: {}", path, err);
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        let pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr)
            .ok_or_else(|| anyhow!(UnsupportedFormat(format.fourcc.to_string())))?;

        let mut state = V4l2StateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, CAPTURE_BUFFERS)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;
        state.with_stream_mut(|stream| stream.set_timeout(timeouts.read));

        Ok(Self {
            path: path.to_string(),
            state,
            width: format.width,
            height: format.height,
            format: pixel_format,
            read_timeout: timeouts.read,
        })
    }
}

impl FrameReader for V4l2Reader {
    fn read_frame(&mut self) -> Result<RawImage, CaptureError> {
        use v4l::io::traits::CaptureStream;

        let (width, height, format) = (self.width, self.height, self.format);
        let read_timeout = self.read_timeout;
        self.state.with_stream_mut(|stream| {
            let (buf, _meta) = stream.next().map_err(|err| {
                if err.kind() == std::io::ErrorKind::TimedOut {
                    CaptureError::Timeout(read_timeout)
                } else {
                    CaptureError::connection(anyhow::Error::new(err).context("capture v4l2 frame"))
                }
            })?;
            let pixels = normalize_to_rgb(buf, width, height, format).map_err(CaptureError::decode)?;
            Ok(RawImage {
                pixels,
                width,
                height,
            })
        })
    }
}

#[derive(Debug)]
struct UnsupportedFormat(String);

impl std::fmt::Display for UnsupportedFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "device pixel format {} is not supported", self.0)
    }
}

impl std::error::Error for UnsupportedFormat {}
