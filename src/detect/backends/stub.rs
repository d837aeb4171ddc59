use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::RawDetection;
use crate::frame::Frame;

/// Stub backend for dry runs and tests. Reports a fixed list of boxes for
/// every frame, minus those whose top-left corner lies outside the frame.
#[derive(Clone, Debug, Default)]
pub struct StubBackend {
    detections: Vec<RawDetection>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_detections(detections: Vec<RawDetection>) -> Self {
        Self { detections }
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<RawDetection>> {
        let (w, h) = (frame.width as i32, frame.height as i32);
        Ok(self
            .detections
            .iter()
            .filter(|d| d.bbox.x1 < w && d.bbox.y1 < h)
            .cloned()
            .collect())
    }
}
