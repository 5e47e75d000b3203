use crate::labels::ClassNames;
use image::DynamicImage;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Model weights not found: {0:?}")]
    MissingWeights(PathBuf),
    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("Error decoding image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("Malformed detector output: {0}")]
    InvalidOutput(String),
    #[error("Inference failed: {0}")]
    Inference(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub class_id: usize,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// An object detection model that can be queried for one image at a time.
pub trait Detector: Send + Sync + 'static {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<BoundingBox>, DetectorError>;

    fn class_names(&self) -> &ClassNames;
}
