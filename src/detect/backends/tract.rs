#![cfg(feature = "backend-tract")]

use std::path::Path;

use image::imageops::{self, FilterType};
use tract_onnx::prelude::*;

use crate::detect::backend::{check_frame, DetectorBackend};
use crate::detect::result::Detection;
use crate::detect::yolo::{self, DecodeParams};
use crate::error::DetectionError;
use crate::frame::Frame;

fn model_err(context: &str, err: impl std::fmt::Display) -> DetectionError {
    DetectionError::Model(format!("{context}: {err}"))
}

/// Tract-based YOLOv8 backend.
///
/// Frames are stretched to the model input size; boxes are scaled back to
/// frame pixels after decoding.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>, TypedModel>,
    input_width: u32,
    input_height: u32,
    confidence_threshold: f32,
    iou_threshold: f32,
    labels: Vec<String>,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        input_width: u32,
        input_height: u32,
    ) -> Result<Self, DetectionError> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .map_err(|e| model_err(&format!("load {}", model_path.display()), e))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, input_height as usize, input_width as usize),
                ),
            )
            .map_err(|e| model_err("set input fact", e))?
            .into_optimized()
            .map_err(|e| model_err("optimize model", e))?
            .into_runnable()
            .map_err(|e| model_err("build runnable model", e))?;

        log::info!(
            "TractBackend: loaded {} ({}x{})",
            model_path.display(),
            input_width,
            input_height
        );
        Ok(Self {
            model,
            input_width,
            input_height,
            confidence_threshold: 0.4,
            iou_threshold: 0.45,
            labels: yolo::coco_labels(),
        })
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    fn build_input(&self, frame: &Frame) -> Tensor {
        let resized = imageops::resize(
            frame.image(),
            self.input_width,
            self.input_height,
            FilterType::Triangle,
        );
        let width = self.input_width as usize;
        let pixels = resized.as_raw();
        tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.input_height as usize, width),
            |(_, channel, y, x)| pixels[(y * width + x) * 3 + channel] as f32 / 255.0,
        )
        .into_tensor()
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectionError> {
        check_frame(frame)?;
        let input = self.build_input(frame);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .map_err(|e| model_err("inference failed", e))?;
        let output = outputs
            .first()
            .ok_or_else(|| DetectionError::Model("model produced no outputs".into()))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| model_err("output tensor was not f32", e))?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[1] < 5 {
            return Err(DetectionError::Model(format!(
                "unexpected output shape {shape:?}"
            )));
        }
        let flat: Vec<f32> = view.iter().copied().collect();
        let params = DecodeParams {
            num_classes: shape[1] - 4,
            num_anchors: shape[2],
            confidence: self.confidence_threshold,
            iou_threshold: self.iou_threshold,
            scale_x: frame.width() as f32 / self.input_width as f32,
            scale_y: frame.height() as f32 / self.input_height as f32,
            frame_width: frame.width() as f32,
            frame_height: frame.height() as f32,
        };
        Ok(yolo::decode(&flat, &params, &self.labels))
    }

    fn warm_up(&mut self) -> Result<(), DetectionError> {
        let blank = Frame::new(
            "warm-up",
            0,
            image::RgbImage::new(self.input_width, self.input_height),
        );
        self.detect(&blank).map(|_| ())
    }
}
