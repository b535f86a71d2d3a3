//! Synthetic `stub://` source for demos and tests.
//!
//! `stub://<name>[?size=WxH][&fps=N]` yields a deterministic scene: a textured
//! gray background with a red square sliding left to right. Frames are paced at
//! `fps` (default 30; `fps=0` disables pacing).

use std::time::{Duration, Instant};

use super::{FrameReader, RawImage};
use crate::error::CaptureError;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FPS: u32 = 30;
const SQUARE_STEP_PX: u64 = 4;

pub struct SyntheticReader {
    name: String,
    width: u32,
    height: u32,
    interval: Option<Duration>,
    frame_count: u64,
    next_due: Option<Instant>,
}

impl SyntheticReader {
    pub fn from_url(url: &str) -> Result<Self, CaptureError> {
        let rest = url
            .strip_prefix("stub://")
            .ok_or_else(|| CaptureError::Unsupported(format!("not a stub url: {}", url)))?;
        let (name, query) = rest.split_once('?').unwrap_or((rest, ""));

        let mut width = DEFAULT_WIDTH;
        let mut height = DEFAULT_HEIGHT;
        let mut fps = DEFAULT_FPS;
        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "size" => {
                    let (w, h) = value
                        .split_once('x')
                        .and_then(|(w, h)| Some((w.parse::<u32>().ok()?, h.parse::<u32>().ok()?)))
                        .filter(|&(w, h)| w > 0 && h > 0)
                        .ok_or_else(|| {
                            CaptureError::Connection(format!("invalid stub size '{}'", value))
                        })?;
                    width = w;
                    height = h;
                }
                "fps" => {
                    fps = value.parse().map_err(|_| {
                        CaptureError::Connection(format!("invalid stub fps '{}'", value))
                    })?;
                }
                other => log::debug!("stub source {}: ignoring option '{}'", name, other),
            }
        }

        log::info!(
            "SyntheticReader: connected to stub://{} ({}x{} @ {} fps)",
            name,
            width,
            height,
            fps
        );
        Ok(Self {
            name: name.to_string(),
            width,
            height,
            interval: (fps > 0).then(|| Duration::from_secs_f64(1.0 / fps as f64)),
            frame_count: 0,
            next_due: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn pace(&mut self) {
        let Some(interval) = self.interval else {
            return;
        };
        if let Some(due) = self.next_due {
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        self.next_due = Some(Instant::now() + interval);
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let w = self.width as usize;
        let h = self.height as usize;
        let side = (w.min(h) / 4).max(1);
        let travel = (w.saturating_sub(side)).max(1) as u64;
        let square_x = ((self.frame_count * SQUARE_STEP_PX) % travel) as usize;
        let square_y = (h.saturating_sub(side)) / 2;

        let mut pixels = vec![0u8; w * h * 3];
        for y in 0..h {
            for x in 0..w {
                let offset = (y * w + x) * 3;
                let inside = x >= square_x
                    && x < square_x + side
                    && y >= square_y
                    && y < square_y + side;
                let rgb = if inside {
                    [220, 30, 30]
                } else {
                    let shade = 64 + ((x + y) % 32) as u8;
                    [shade, shade, shade]
                };
                pixels[offset..offset + 3].copy_from_slice(&rgb);
            }
        }
        pixels
    }
}

impl FrameReader for SyntheticReader {
    fn read_frame(&mut self) -> Result<RawImage, CaptureError> {
        self.pace();
        let pixels = self.generate_pixels();
        self.frame_count += 1;
        Ok(RawImage {
            pixels,
            width: self.width,
            height: self.height,
        })
    }
}
