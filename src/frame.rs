//! Decoded frames and the single-slot buffer between a camera worker and its
//! consumers.
//!
//! - `Frame`: immutable RGB8 image tagged with its camera and a per-camera
//!   sequence number. Shared as `Arc<Frame>`; never mutated after publish.
//! - `FrameBuffer`: holds at most one frame. Publishing replaces the previous
//!   frame; reading never blocks on the producer for longer than a pointer swap.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::CameraId;

/// Bytes per pixel of the interleaved RGB8 layout every reader produces.
pub const RGB_CHANNELS: usize = 3;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One decoded image at the source's native resolution.
///
/// Pixel data is private and read-only; consumers borrow it through `pixels()`.
/// There is no way to mutate a frame once it has been built.
#[derive(Debug)]
pub struct Frame {
    camera_id: CameraId,
    /// Strictly increasing per camera, starting at 1.
    sequence: u64,
    captured_at: Instant,
    pixels: Vec<u8>,
    width: u32,
    height: u32,
}

impl Frame {
    /// Build a frame from interleaved RGB8 pixels.
    ///
    /// Returns `None` if the buffer length does not match `width * height * 3`.
    pub fn new(
        camera_id: impl Into<CameraId>,
        sequence: u64,
        pixels: Vec<u8>,
        width: u32,
        height: u32,
    ) -> Option<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(RGB_CHANNELS)?;
        if pixels.len() != expected {
            return None;
        }
        Some(Self {
            camera_id: camera_id.into(),
            sequence,
            captured_at: Instant::now(),
            pixels,
            width,
            height,
        })
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// RGB value at `(x, y)`, or `None` outside the image.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * RGB_CHANNELS;
        Some([self.pixels[idx], self.pixels[idx + 1], self.pixels[idx + 2]])
    }
}

// ----------------------------------------------------------------------------
// FrameBuffer
// ----------------------------------------------------------------------------

/// Latest-frame-wins slot for one camera.
///
/// Exactly one writer (the camera's worker) and any number of readers.
/// Readers get either the newest complete frame or nothing; they never see a
/// partially written frame because publishing swaps an `Arc`.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    slot: Mutex<Option<Arc<Frame>>>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the held frame. The previous frame stays alive only as long as
    /// some reader still holds it.
    pub fn publish(&self, frame: Frame) {
        let frame = Arc::new(frame);
        match self.slot.lock() {
            Ok(mut slot) => *slot = Some(frame),
            Err(poisoned) => *poisoned.into_inner() = Some(frame),
        }
    }

    /// Most recent frame, or `None` if nothing has been published yet.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        match self.slot.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Sequence number of the held frame, without cloning it.
    pub fn latest_sequence(&self) -> Option<u64> {
        match self.slot.lock() {
            Ok(slot) => slot.as_ref().map(|frame| frame.sequence()),
            Err(poisoned) => poisoned.into_inner().as_ref().map(|frame| frame.sequence()),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
