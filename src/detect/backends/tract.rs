#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::adapter::DetectionAdapter;
use crate::detect::result::Detection;
use crate::error::PerceptionError;
use crate::frame::{Frame, RGB_CHANNELS};
use crate::BoundingBox;

const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_CONFIDENCE: f32 = 0.3;
const DEFAULT_IOU: f32 = 0.45;
const DEFAULT_MIN_AREA: f32 = 500.0;
const DEFAULT_MAX_AREA: f32 = 200_000.0;

/// COCO class names in YOLOv8 output order.
pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

/// YOLOv8 object detector running an exported ONNX model on tract.
///
/// The frame is resampled to the square model input; boxes are mapped back to
/// frame pixels, filtered by confidence, class allow-list and area, then
/// de-duplicated with per-class non-maximum suppression.
pub struct YoloDetector {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    confidence_threshold: f32,
    iou_threshold: f32,
    min_area: f32,
    max_area: f32,
    allowed_classes: Option<Vec<String>>,
}

impl YoloDetector {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let model_path = model_path.as_ref();
        let input_size = DEFAULT_INPUT_SIZE;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, input_size as usize, input_size as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            confidence_threshold: DEFAULT_CONFIDENCE,
            iou_threshold: DEFAULT_IOU,
            min_area: DEFAULT_MIN_AREA,
            max_area: DEFAULT_MAX_AREA,
            allowed_classes: None,
        })
    }

    pub fn with_thresholds(mut self, confidence: f32, iou: f32) -> Self {
        self.confidence_threshold = confidence;
        self.iou_threshold = iou;
        self
    }

    pub fn with_area_limits(mut self, min_area: f32, max_area: f32) -> Self {
        self.min_area = min_area;
        self.max_area = max_area;
        self
    }

    /// Only report these class names. An empty list allows every class.
    pub fn with_allowed_classes(mut self, classes: Vec<String>) -> Self {
        self.allowed_classes = (!classes.is_empty()).then_some(classes);
        self
    }

    fn build_input(&self, frame: &Frame) -> Tensor {
        let size = self.input_size as usize;
        let (fw, fh) = (frame.width() as usize, frame.height() as usize);
        let pixels = frame.pixels();
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, channel, y, x)| {
            let sx = (x * fw / size).min(fw - 1);
            let sy = (y * fh / size).min(fh - 1);
            let idx = (sy * fw + sx) * RGB_CHANNELS + channel;
            pixels[idx] as f32 / 255.0
        });
        input.into_tensor()
    }

    fn decode(&self, outputs: TVec<TValue>, frame: &Frame) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[1] < 5 {
            return Err(anyhow!("unexpected YOLOv8 output shape {:?}", shape));
        }
        let (attributes, anchors) = (shape[1], shape[2]);
        let scale_x = frame.width() as f32 / self.input_size as f32;
        let scale_y = frame.height() as f32 / self.input_size as f32;

        let mut candidates = Vec::new();
        for anchor in 0..anchors {
            let (class_id, score) = (4..attributes)
                .map(|a| (a - 4, view[[0, a, anchor]]))
                .fold((0, f32::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });
            if score < self.confidence_threshold {
                continue;
            }
            let label = COCO_CLASSES
                .get(class_id)
                .map(|name| name.to_string())
                .unwrap_or_else(|| format!("class_{}", class_id));
            if let Some(allowed) = &self.allowed_classes {
                if !allowed.iter().any(|name| name == &label) {
                    continue;
                }
            }

            let cx = view[[0, 0, anchor]] * scale_x;
            let cy = view[[0, 1, anchor]] * scale_y;
            let w = view[[0, 2, anchor]] * scale_x;
            let h = view[[0, 3, anchor]] * scale_y;
            let bbox = BoundingBox::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0);
            let area = bbox.area();
            if area < self.min_area || area > self.max_area {
                continue;
            }
            candidates.push(Detection::new(bbox, label, score));
        }

        Ok(non_max_suppression(candidates, self.iou_threshold))
    }
}

impl DetectionAdapter for YoloDetector {
    fn name(&self) -> &'static str {
        "yolov8-tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, PerceptionError> {
        let input = self.build_input(frame);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .map_err(|err| PerceptionError::DetectionUnavailable(format!("ONNX inference failed: {}", err)))?;
        self.decode(outputs, frame)
            .map_err(|err| PerceptionError::DetectionUnavailable(format!("{:#}", err)))
    }
}

/// Greedy per-class NMS, highest confidence first.
pub fn non_max_suppression(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::new();
    for candidate in candidates {
        let suppressed = kept.iter().any(|k| {
            k.class_label == candidate.class_label && k.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}
