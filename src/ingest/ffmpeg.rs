//! Generic FFmpeg reader: opens a URL, file path or device node and lets
//! libavformat probe the container.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use super::{FrameReader, RawImage, Timeouts};
use crate::error::CaptureError;

pub(crate) struct FfmpegReader {
    target: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    read_timeout: Duration,
    flushed: bool,
}

impl FfmpegReader {
    pub(crate) fn open(target: &str, timeouts: Timeouts) -> Result<Self, CaptureError> {
        let reader = Self::build(target, timeouts).map_err(CaptureError::connection)?;
        log::info!("FfmpegReader: connected to {}", target);
        Ok(reader)
    }

    fn build(target: &str, timeouts: Timeouts) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;

        let mut options = ffmpeg::Dictionary::new();
        let connect_us = timeouts.connect.as_micros().to_string();
        options.set("rw_timeout", &connect_us);
        options.set("timeout", &connect_us);

        let input = ffmpeg::format::input_with_dictionary(&target, options)
            .with_context(|| format!("failed to open '{}' with ffmpeg", target))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("'{}' has no video track", target))?;
        let stream_index = input_stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        Ok(Self {
            target: target.to_string(),
            input,
            stream_index,
            decoder,
            scaler,
            read_timeout: timeouts.read,
            flushed: false,
        })
    }

    fn convert(&mut self, decoded: &ffmpeg::frame::Video) -> Result<RawImage, CaptureError> {
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        self.scaler
            .run(decoded, &mut rgb_frame)
            .context("scale frame to RGB")
            .map_err(CaptureError::decode)?;
        frame_to_image(&rgb_frame).map_err(CaptureError::decode)
    }
}

impl FrameReader for FfmpegReader {
    fn read_frame(&mut self) -> Result<RawImage, CaptureError> {
        let mut decoded = ffmpeg::frame::Video::empty();
        if self.decoder.receive_frame(&mut decoded).is_ok() {
            return self.convert(&decoded);
        }
        if self.flushed {
            return Err(CaptureError::EndOfStream);
        }

        let started = std::time::Instant::now();
        let mut packet = ffmpeg::Packet::empty();
        loop {
            match packet.read(&mut self.input) {
                Ok(()) => {}
                Err(ffmpeg::Error::Eof) => {
                    self.flushed = true;
                    let _ = self.decoder.send_eof();
                    return match self.decoder.receive_frame(&mut decoded) {
                        Ok(()) => self.convert(&decoded),
                        Err(_) => Err(CaptureError::EndOfStream),
                    };
                }
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => {
                    if started.elapsed() > self.read_timeout {
                        return Err(CaptureError::Timeout(self.read_timeout));
                    }
                    continue;
                }
                Err(err) => {
                    return Err(CaptureError::connection(
                        anyhow::Error::new(err).context(format!("read packet from {}", self.target)),
                    ))
                }
            }

            if packet.stream() != self.stream_index {
                continue;
            }
            self.decoder
                .send_packet(&packet)
                .context("send packet to ffmpeg decoder")
                .map_err(CaptureError::decode)?;
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return self.convert(&decoded);
            }
            if started.elapsed() > self.read_timeout {
                return Err(CaptureError::Timeout(self.read_timeout));
            }
        }
    }
}

fn frame_to_image(frame: &ffmpeg::frame::Video) -> Result<RawImage> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok(RawImage {
        pixels,
        width,
        height,
    })
}
