use std::time::SystemTime;

use serde::Serialize;

/// Axis-aligned box in frame pixel coordinates (top-left origin).
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.w).min(other.x + other.w);
        let bottom = (self.y + self.h).min(other.y + other.h);
        let intersection = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

/// One classified bounding box.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub class_label: String,
    /// Always within 0..=1.
    pub confidence: f32,
    pub bounding_box: BoundingBox,
}

impl Detection {
    pub fn new(class_label: impl Into<String>, confidence: f32, bounding_box: BoundingBox) -> Self {
        Self {
            class_label: class_label.into(),
            confidence: confidence.clamp(0.0, 1.0),
            bounding_box,
        }
    }
}

/// Detections computed from one frame of one source.
#[derive(Clone, Debug)]
pub struct DetectionResult {
    pub source_id: String,
    /// Sequence number of the frame these detections were computed from.
    pub for_sequence: u64,
    pub computed_at: SystemTime,
    pub detections: Vec<Detection>,
}

impl DetectionResult {
    pub fn new(source_id: impl Into<String>, for_sequence: u64, detections: Vec<Detection>) -> Self {
        Self {
            source_id: source_id.into(),
            for_sequence,
            computed_at: SystemTime::now(),
            detections,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}
