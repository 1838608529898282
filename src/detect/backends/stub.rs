use crate::detect::backend::{check_frame, DetectorBackend};
use crate::detect::result::{BoundingBox, Detection};
use crate::error::DetectionError;
use crate::frame::Frame;

/// Stub backend for testing. Returns the same detections for every frame.
///
/// Without an explicit list it reports one `car` covering the middle half of
/// the frame.
#[derive(Clone, Debug, Default)]
pub struct StubBackend {
    fixed: Option<Vec<Detection>>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_detections(detections: Vec<Detection>) -> Self {
        Self {
            fixed: Some(detections),
        }
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectionError> {
        check_frame(frame)?;
        if let Some(fixed) = &self.fixed {
            return Ok(fixed.clone());
        }
        let (w, h) = (frame.width() as f32, frame.height() as f32);
        Ok(vec![Detection::new(
            "car",
            0.9,
            BoundingBox::new(w / 4.0, h / 4.0, w / 2.0, h / 2.0),
        )])
    }
}
