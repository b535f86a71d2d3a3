use crate::detect::adapter::DetectionAdapter;
use crate::detect::result::Detection;
use crate::error::PerceptionError;
use crate::frame::{Frame, RGB_CHANNELS};
use crate::BoundingBox;

const DEFAULT_TOLERANCE: u8 = 40;
const DEFAULT_MIN_PIXELS: usize = 16;
const SAMPLE_STRIDE: u32 = 2;

/// CPU detector for a single solid-colored marker.
///
/// Reports the bounding box of all pixels within `tolerance` of the target
/// color. Good enough for calibration targets and the synthetic `stub://`
/// scene, where it finds the moving red square.
#[derive(Clone, Debug)]
pub struct ColorMarkerDetector {
    target: [u8; 3],
    tolerance: u8,
    min_pixels: usize,
    label: String,
}

impl ColorMarkerDetector {
    pub fn new(target: [u8; 3], label: impl Into<String>) -> Self {
        Self {
            target,
            tolerance: DEFAULT_TOLERANCE,
            min_pixels: DEFAULT_MIN_PIXELS,
            label: label.into(),
        }
    }

    /// Matches the red square drawn by the synthetic source.
    pub fn synthetic_marker() -> Self {
        Self::new([220, 30, 30], "marker")
    }

    pub fn with_tolerance(mut self, tolerance: u8) -> Self {
        self.tolerance = tolerance;
        self
    }

    fn matches(&self, rgb: &[u8]) -> bool {
        rgb.iter()
            .zip(self.target.iter())
            .all(|(&c, &t)| c.abs_diff(t) <= self.tolerance)
    }
}

impl DetectionAdapter for ColorMarkerDetector {
    fn name(&self) -> &'static str {
        "color-marker"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, PerceptionError> {
        let width = frame.width();
        let pixels = frame.pixels();

        let mut hits = 0usize;
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for y in (0..frame.height()).step_by(SAMPLE_STRIDE as usize) {
            for x in (0..width).step_by(SAMPLE_STRIDE as usize) {
                let idx = (y as usize * width as usize + x as usize) * RGB_CHANNELS;
                if !self.matches(&pixels[idx..idx + RGB_CHANNELS]) {
                    continue;
                }
                hits += 1;
                bounds = Some(match bounds {
                    None => (x, y, x, y),
                    Some((x1, y1, x2, y2)) => (x1.min(x), y1.min(y), x2.max(x), y2.max(y)),
                });
            }
        }

        let Some((x1, y1, x2, y2)) = bounds else {
            return Ok(Vec::new());
        };
        let sampled_area = (hits as u64) * (SAMPLE_STRIDE as u64).pow(2);
        if (sampled_area as usize) < self.min_pixels {
            return Ok(Vec::new());
        }

        let bbox = BoundingBox::new(
            x1 as f32,
            y1 as f32,
            (x2 + SAMPLE_STRIDE).min(width) as f32,
            (y2 + SAMPLE_STRIDE).min(frame.height()) as f32,
        );
        let fill = sampled_area as f32 / bbox.area().max(1.0);
        Ok(vec![Detection::new(bbox, self.label.clone(), fill.min(1.0))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_square(x0: u32, y0: u32, side: u32) -> Frame {
        let (w, h) = (64u32, 48u32);
        let mut pixels = vec![80u8; (w * h * 3) as usize];
        for y in y0..y0 + side {
            for x in x0..x0 + side {
                let idx = ((y * w + x) * 3) as usize;
                pixels[idx..idx + 3].copy_from_slice(&[220, 30, 30]);
            }
        }
        Frame::new("camera1", 1, pixels, w, h).unwrap()
    }

    #[test]
    fn finds_marker_bounds() {
        let mut detector = ColorMarkerDetector::synthetic_marker();
        let detections = detector.detect(&frame_with_square(10, 20, 12)).unwrap();
        assert_eq!(detections.len(), 1);
        let bbox = detections[0].bbox;
        assert_eq!((bbox.x1, bbox.y1), (10.0, 20.0));
        assert_eq!((bbox.x2, bbox.y2), (22.0, 32.0));
        assert_eq!(detections[0].class_label, "marker");
    }

    #[test]
    fn empty_scene_has_no_detections() {
        let mut detector = ColorMarkerDetector::synthetic_marker();
        let frame = Frame::new("camera1", 1, vec![80u8; 16 * 16 * 3], 16, 16).unwrap();
        assert!(detector.detect(&frame).unwrap().is_empty());
    }

    #[test]
    fn tiny_blobs_are_ignored() {
        let mut detector = ColorMarkerDetector::synthetic_marker();
        assert!(detector.detect(&frame_with_square(10, 10, 2)).unwrap().is_empty());
    }
}
