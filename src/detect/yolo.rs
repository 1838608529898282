//! YOLOv8 output decoding.
//!
//! The detection head emits `[1, 4 + classes, anchors]`: per anchor a
//! `cx, cy, w, h` box in model input pixels followed by one score per class.

use super::result::{BoundingBox, Detection};

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

/// Output geometry and thresholds.
#[derive(Clone, Copy, Debug)]
pub struct DecodeParams {
    pub num_classes: usize,
    pub num_anchors: usize,
    pub confidence: f32,
    pub iou_threshold: f32,
    /// Multiply model-space x/w by this to get frame pixels.
    pub scale_x: f32,
    pub scale_y: f32,
    pub frame_width: f32,
    pub frame_height: f32,
}

/// Decode a flat `[4 + classes, anchors]` tensor into detections.
pub fn decode(output: &[f32], params: &DecodeParams, labels: &[String]) -> Vec<Detection> {
    let rows = 4 + params.num_classes;
    let n = params.num_anchors;
    if output.len() < rows * n {
        return Vec::new();
    }
    let at = |row: usize, anchor: usize| output[row * n + anchor];

    let mut found = Vec::new();
    for anchor in 0..n {
        let mut best = (0usize, f32::NEG_INFINITY);
        for class in 0..params.num_classes {
            let score = at(4 + class, anchor);
            if score > best.1 {
                best = (class, score);
            }
        }
        let (class, confidence) = best;
        if confidence.is_nan() || confidence < params.confidence {
            continue;
        }
        let w = at(2, anchor) * params.scale_x;
        let h = at(3, anchor) * params.scale_y;
        let x = (at(0, anchor) * params.scale_x - w / 2.0).clamp(0.0, params.frame_width);
        let y = (at(1, anchor) * params.scale_y - h / 2.0).clamp(0.0, params.frame_height);
        let label = labels
            .get(class)
            .cloned()
            .unwrap_or_else(|| format!("class_{class}"));
        found.push(Detection::new(label, confidence, BoundingBox::new(x, y, w, h)));
    }
    non_max_suppression(&mut found, params.iou_threshold);
    found
}

/// Keep the most confident box out of every cluster overlapping above
/// `iou_threshold`. Output is sorted by confidence, highest first.
pub fn non_max_suppression(xs: &mut Vec<Detection>, iou_threshold: f32) {
    xs.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept = 0;
    for index in 0..xs.len() {
        let overlaps = (0..kept).any(|prev| {
            xs[prev].class_label == xs[index].class_label
                && xs[prev].bounding_box.iou(&xs[index].bounding_box) > iou_threshold
        });
        if !overlaps {
            xs.swap(kept, index);
            kept += 1;
        }
    }
    xs.truncate(kept);
}

pub fn coco_labels() -> Vec<String> {
    COCO_CLASSES.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(anchors: usize) -> DecodeParams {
        DecodeParams {
            num_classes: 2,
            num_anchors: anchors,
            confidence: 0.4,
            iou_threshold: 0.45,
            scale_x: 2.0,
            scale_y: 2.0,
            frame_width: 200.0,
            frame_height: 200.0,
        }
    }

    #[test]
    fn decodes_boxes_above_threshold_and_scales_them() {
        // rows: cx, cy, w, h, score(a), score(b); two anchors
        let output = vec![
            50.0, 10.0, // cx
            50.0, 10.0, // cy
            20.0, 4.0, // w
            10.0, 4.0, // h
            0.9, 0.1, // class a
            0.05, 0.2, // class b
        ];
        let labels = vec!["a".to_string(), "b".to_string()];
        let out = decode(&output, &params(2), &labels);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].class_label, "a");
        assert_eq!(out[0].bounding_box, BoundingBox::new(80.0, 90.0, 40.0, 20.0));
    }

    #[test]
    fn nms_drops_overlapping_boxes_of_the_same_class() {
        let mut xs = vec![
            Detection::new("car", 0.6, BoundingBox::new(0.0, 0.0, 10.0, 10.0)),
            Detection::new("car", 0.9, BoundingBox::new(1.0, 1.0, 10.0, 10.0)),
            Detection::new("person", 0.5, BoundingBox::new(1.0, 1.0, 10.0, 10.0)),
            Detection::new("car", 0.7, BoundingBox::new(50.0, 50.0, 10.0, 10.0)),
        ];
        non_max_suppression(&mut xs, 0.45);
        let confidences: Vec<f32> = xs.iter().map(|d| d.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.7, 0.5]);
    }

    #[test]
    fn short_output_decodes_to_nothing() {
        assert!(decode(&[0.0; 3], &params(2), &[]).is_empty());
    }
}
