//! RTSP reader using GStreamer.
//!
//! Pipeline: `rtspsrc ! decodebin ! videoconvert ! appsink` with RGB caps and a
//! one-buffer drop-oldest appsink, so the reader always returns the newest
//! decoded frame. The forced variant pins the RTSP transport to TCP, which gets
//! through NAT and lossy links where the negotiated UDP transport stalls.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;

use super::{FrameReader, RawImage, Timeouts};
use crate::error::CaptureError;

pub(crate) struct GstreamerReader {
    url: String,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    read_timeout: Duration,
}

impl GstreamerReader {
    pub(crate) fn open(
        url: &str,
        force_tcp: bool,
        timeouts: Timeouts,
    ) -> Result<Self, CaptureError> {
        let reader = Self::build(url, force_tcp, timeouts.read).map_err(CaptureError::connection)?;
        reader.start(timeouts.connect)?;
        log::info!(
            "GstreamerReader: connected to {}{}",
            url,
            if force_tcp { " (tcp)" } else { "" }
        );
        Ok(reader)
    }

    fn build(url: &str, force_tcp: bool, read_timeout: Duration) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let protocols = if force_tcp { " protocols=tcp" } else { "" };
        let pipeline_description = format!(
            "rtspsrc location={}{} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            url, protocols
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            url: url.to_string(),
            pipeline,
            appsink,
            read_timeout,
        })
    }

    fn start(&self, connect_timeout: Duration) -> Result<(), CaptureError> {
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")
            .map_err(CaptureError::connection)?;
        let (result, _current, _pending) = self
            .pipeline
            .state(gstreamer::ClockTime::from_mseconds(connect_timeout.as_millis() as u64));
        result
            .map_err(|err| {
                CaptureError::Connection(format!("{} did not start playing: {:?}", self.url, err))
            })
            .map(|_| ())
    }

    fn poll_bus(&self) -> Result<(), CaptureError> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(CaptureError::Connection(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    )));
                }
                MessageView::Eos(..) => return Err(CaptureError::EndOfStream),
                _ => {}
            }
        }
        Ok(())
    }
}

impl FrameReader for GstreamerReader {
    fn read_frame(&mut self) -> Result<RawImage, CaptureError> {
        self.poll_bus()?;

        let timeout = gstreamer::ClockTime::from_mseconds(self.read_timeout.as_millis() as u64);
        match self.appsink.try_pull_sample(timeout) {
            Some(sample) => sample_to_image(&sample).map_err(CaptureError::decode),
            None if self.appsink.is_eos() => Err(CaptureError::EndOfStream),
            None => Err(CaptureError::Timeout(self.read_timeout)),
        }
    }
}

impl Drop for GstreamerReader {
    fn drop(&mut self) {
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("GstreamerReader: failed to stop {}: {}", self.url, err);
        }
    }
}

fn sample_to_image(sample: &gstreamer::Sample) -> Result<RawImage> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok(RawImage {
            pixels: data
                .get(..row_bytes * height as usize)
                .context("RTSP buffer shorter than frame")?
                .to_vec(),
            width,
            height,
        });
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Ok(RawImage {
        pixels,
        width,
        height,
    })
}
