use crate::detect::adapter::DetectionAdapter;
use crate::detect::result::Detection;
use crate::error::PerceptionError;
use crate::frame::Frame;

/// Detector that never finds anything. Keeps the pipeline running when no
/// model is configured.
#[derive(Debug, Default)]
pub struct StubDetector;

impl StubDetector {
    pub fn new() -> Self {
        Self
    }
}

impl DetectionAdapter for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>, PerceptionError> {
        Ok(Vec::new())
    }
}
