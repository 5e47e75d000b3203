use crate::{
    config::{Device, LabelsConfig, ModelConfig, Validatable},
    detector::{BoundingBox, Detector, DetectorError},
    labels::{load_labels, parse_metadata_names, select_class_names, ClassNames},
};
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::{s, Array, ArrayD, ArrayView2, ArrayViewD, Axis, Ix4};
use ort::{
    execution_providers::{
        CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch,
        TensorRTExecutionProvider,
    },
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

const INPUT_SIZE: u32 = 640;
const BOX_FEATURES: usize = 4;

fn intersection(box1: &BoundingBox, box2: &BoundingBox) -> f32 {
    let width = box1.x2.min(box2.x2) - box1.x1.max(box2.x1);
    let height = box1.y2.min(box2.y2) - box1.y1.max(box2.y1);
    width.max(0.) * height.max(0.)
}

fn union(box1: &BoundingBox, box2: &BoundingBox) -> f32 {
    ((box1.x2 - box1.x1) * (box1.y2 - box1.y1)) + ((box2.x2 - box2.x1) * (box2.y2 - box2.y1))
        - intersection(box1, box2)
}

fn iou(box1: &BoundingBox, box2: &BoundingBox) -> f32 {
    let union = union(box1, box2);
    if union <= 0. {
        return 0.;
    }
    intersection(box1, box2) / union
}

fn transform_image(image: &DynamicImage) -> (Array<f32, Ix4>, u32, u32) {
    let (img_width, img_height) = image.dimensions();
    let img = image.resize_exact(INPUT_SIZE, INPUT_SIZE, FilterType::CatmullRom);

    let size = INPUT_SIZE as usize;
    let mut input = Array::zeros((1, 3, size, size));
    for pixel in img.pixels() {
        let x = pixel.0 as usize;
        let y = pixel.1 as usize;
        let [r, g, b, _] = pixel.2 .0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    (input, img_height, img_width)
}

/// Decodes a YOLOv8 output tensor of shape `[1, 4 + classes, anchors]` into
/// boxes in original image coordinates, after non-maximum suppression.
fn postprocess(
    output: ArrayViewD<f32>,
    img_width: u32,
    img_height: u32,
    min_probability: f32,
    iou_threshold: f32,
) -> Result<Vec<BoundingBox>, DetectorError> {
    let shape = output.shape();
    if shape.len() != 3 || shape[0] != 1 || shape[1] <= BOX_FEATURES {
        return Err(DetectorError::InvalidOutput(format!(
            "expected [1, 4 + classes, anchors], got {:?}",
            shape
        )));
    }

    let predictions: ArrayView2<f32> = output.slice(s![0, .., ..]);
    let x_scale = img_width as f32 / INPUT_SIZE as f32;
    let y_scale = img_height as f32 / INPUT_SIZE as f32;

    let mut boxes = Vec::new();
    for anchor in predictions.axis_iter(Axis(1)) {
        let best = anchor
            .iter()
            .skip(BOX_FEATURES)
            .copied()
            .enumerate()
            .fold(None, |best: Option<(usize, f32)>, (index, value)| match best {
                Some((_, prob)) if prob >= value => best,
                _ => Some((index, value)),
            });

        let Some((class_id, prob)) = best else {
            continue;
        };
        if !prob.is_finite() {
            return Err(DetectorError::InvalidOutput(format!(
                "non-finite class score {}",
                prob
            )));
        }
        if prob < min_probability {
            continue;
        }

        let xc = anchor[0] * x_scale;
        let yc = anchor[1] * y_scale;
        let w = anchor[2] * x_scale;
        let h = anchor[3] * y_scale;

        boxes.push(BoundingBox {
            class_id,
            confidence: prob,
            x1: xc - w / 2.,
            y1: yc - h / 2.,
            x2: xc + w / 2.,
            y2: yc + h / 2.,
        });
    }

    boxes.sort_by(|box1, box2| box2.confidence.total_cmp(&box1.confidence));
    let mut result = Vec::new();

    while !boxes.is_empty() {
        let best = boxes.remove(0);
        result.push(best);
        boxes.retain(|candidate| iou(&best, candidate) < iou_threshold);
    }

    Ok(result)
}

fn execution_provider(device: Device) -> ExecutionProviderDispatch {
    match device {
        Device::Cpu => CPUExecutionProvider::default().build(),
        Device::Cuda(device_id) => CUDAExecutionProvider::default()
            .with_device_id(device_id)
            .build(),
        Device::TensorRt => TensorRTExecutionProvider::default()
            .with_engine_cache(true)
            .build(),
    }
}

fn build_session(model_path: &Path, device: Device) -> Result<Session, ort::Error> {
    Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_execution_providers([execution_provider(device)])?
        .commit_from_file(model_path)
}

fn metadata_class_names(session: &Session) -> Option<ClassNames> {
    let raw = session
        .metadata()
        .and_then(|metadata| metadata.custom("names"));

    match raw {
        Ok(Some(raw)) => {
            let names = parse_metadata_names(&raw);
            if names.is_none() {
                tracing::warn!("Unrecognized class names in model metadata: {}", raw);
            }
            names
        }
        Ok(None) => {
            tracing::warn!("Model metadata has no class names");
            None
        }
        Err(e) => {
            tracing::warn!("Failed to read model metadata: {}", e);
            None
        }
    }
}

/// YOLO detector running on ONNX Runtime with a round-robin session pool.
pub struct OrtDetector {
    sessions: Vec<Mutex<Session>>,
    counter: AtomicUsize,
    output_name: String,
    class_names: ClassNames,
    min_probability: f32,
    iou_threshold: f32,
}

impl OrtDetector {
    pub fn new(
        model_config: &ModelConfig,
        labels_config: Option<&LabelsConfig>,
    ) -> Result<Self, DetectorError> {
        let model_path = model_config.get_path();
        if model_config.validate().is_err() {
            return Err(DetectorError::MissingWeights(model_path));
        }

        let num_instances = model_config.num_instances.max(1);
        let sessions = (0..num_instances)
            .map(|_| build_session(&model_path, model_config.device))
            .collect::<Result<Vec<_>, ort::Error>>()?;

        let first = sessions
            .first()
            .ok_or_else(|| DetectorError::Inference("no session created".to_string()))?;
        let output_name = first
            .outputs
            .first()
            .map(|output| output.name.clone())
            .ok_or_else(|| DetectorError::InvalidOutput("model has no outputs".to_string()))?;

        let metadata_names = metadata_class_names(first);
        let labels_file = match (&metadata_names, labels_config) {
            (None, Some(labels_config)) => Some(load_labels(&labels_config.get_path())),
            _ => None,
        };
        let class_names = select_class_names(metadata_names, labels_file);

        tracing::info!(
            "Created {} ONNX sessions on {} from {:?} with {} classes",
            num_instances,
            model_config.device,
            model_path,
            class_names.len()
        );

        Ok(Self {
            sessions: sessions.into_iter().map(Mutex::new).collect(),
            counter: AtomicUsize::new(0),
            output_name,
            class_names,
            min_probability: model_config.min_probability,
            iou_threshold: model_config.iou_threshold,
        })
    }

    fn run_inference(&self, input: &Array<f32, Ix4>) -> Result<ArrayD<f32>, DetectorError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|e| DetectorError::Inference(format!("session mutex poisoned: {}", e)))?;

        tracing::debug!("Handling request with session {}", index);
        let tensor_ref = TensorRef::from_array_view(input.view())?;
        let outputs = session.run(ort::inputs![tensor_ref])?;

        let (shape, data) = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;
        ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
            .map_err(|e| DetectorError::InvalidOutput(format!("invalid tensor shape: {}", e)))
    }
}

impl Detector for OrtDetector {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, img_height, img_width) = transform_image(image);
        let output = self.run_inference(&input)?;

        postprocess(
            output.view(),
            img_width,
            img_height,
            self.min_probability,
            self.iou_threshold,
        )
    }

    fn class_names(&self) -> &ClassNames {
        &self.class_names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use std::path::PathBuf;

    fn output_tensor(anchors: &[[f32; 6]]) -> ArrayD<f32> {
        let mut data = Vec::new();
        for feature in 0..6 {
            data.extend(anchors.iter().map(|anchor| anchor[feature]));
        }
        ArrayD::from_shape_vec(vec![1, 6, anchors.len()], data).unwrap()
    }

    #[test]
    fn test_transform_image() {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(100, 50, Rgb([255, 0, 0]));
        let image = DynamicImage::ImageRgb8(img);

        let (input, img_height, img_width) = transform_image(&image);

        assert_eq!(input.shape(), &[1, 3, 640, 640]);
        assert_eq!(img_width, 100);
        assert_eq!(img_height, 50);
        assert!((input[[0, 0, 10, 10]] - 1.0).abs() < 1e-2);
        assert!(input[[0, 1, 10, 10]].abs() < 1e-2);
    }

    #[test]
    fn test_postprocess_suppresses_overlapping_boxes() {
        let output = output_tensor(&[
            [320., 320., 100., 100., 0.9, 0.1],
            [322., 320., 100., 100., 0.8, 0.05],
            [100., 100., 50., 50., 0.1, 0.6],
        ]);

        let boxes = postprocess(output.view(), 640, 640, 0.25, 0.7).unwrap();

        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].class_id, 0);
        assert_eq!(boxes[0].confidence, 0.9);
        assert_eq!(boxes[0].x1, 270.);
        assert_eq!(boxes[1].class_id, 1);
        assert_eq!(boxes[1].confidence, 0.6);
    }

    #[test]
    fn test_postprocess_scales_to_original_image() {
        let output = output_tensor(&[[320., 320., 64., 64., 0.9, 0.0]]);

        let boxes = postprocess(output.view(), 1280, 320, 0.25, 0.7).unwrap();

        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].x1, 576.);
        assert_eq!(boxes[0].x2, 704.);
        assert_eq!(boxes[0].y1, 144.);
        assert_eq!(boxes[0].y2, 176.);
    }

    #[test]
    fn test_postprocess_drops_low_probability() {
        let output = output_tensor(&[[320., 320., 100., 100., 0.1, 0.2]]);

        let boxes = postprocess(output.view(), 640, 640, 0.25, 0.7).unwrap();
        assert!(boxes.is_empty());
    }

    #[test]
    fn test_postprocess_rejects_unexpected_shape() {
        let output = ArrayD::<f32>::zeros(vec![84, 8400]);
        assert!(matches!(
            postprocess(output.view(), 640, 640, 0.25, 0.7),
            Err(DetectorError::InvalidOutput(_))
        ));

        let output = ArrayD::<f32>::zeros(vec![1, 4, 8400]);
        assert!(postprocess(output.view(), 640, 640, 0.25, 0.7).is_err());
    }

    #[test]
    fn test_postprocess_rejects_non_finite_scores() {
        let output = output_tensor(&[[320., 320., 100., 100., f32::NAN, f32::NAN]]);
        assert!(postprocess(output.view(), 640, 640, 0.25, 0.7).is_err());
    }

    #[test]
    fn test_missing_weights_fail_to_load() {
        let model_config = ModelConfig {
            model_dir: PathBuf::from("./no-such-model-dir"),
            onnx_file: Some("missing.onnx".to_string()),
            num_instances: 1,
            min_probability: 0.25,
            iou_threshold: 0.7,
            device: Device::Cpu,
        };

        assert!(matches!(
            OrtDetector::new(&model_config, None),
            Err(DetectorError::MissingWeights(_))
        ));
    }
}
