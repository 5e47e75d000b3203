use crate::{
    aggregator::aggregate,
    config::Config,
    detector::{BoundingBox, Detector, DetectorError},
    labels::ClassNames,
    ort_detector::OrtDetector,
    stub::StubPredictor,
    verdict::{DetectedObject, Verdict},
};
use image::DynamicImage;
use tracing::instrument;

/// Whether a detector could be loaded. Decided once at construction.
pub enum ModelHandle<D: Detector> {
    Available(D),
    Unavailable,
}

pub struct PredictionService<D: Detector> {
    model: ModelHandle<D>,
    stub: StubPredictor,
}

impl PredictionService<OrtDetector> {
    /// Loads the ONNX detector described by `config`. A detector that fails
    /// to load leaves the service in stub-only mode.
    pub fn load(config: &Config) -> Self {
        let stub = StubPredictor::new(config.stub.seed);
        let model = match OrtDetector::new(&config.model, config.labels.as_ref()) {
            Ok(detector) => {
                tracing::info!("Loaded detector from {:?}", config.model.model_dir);
                ModelHandle::Available(detector)
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to load detector ({}); falling back to stub predictions",
                    e
                );
                ModelHandle::Unavailable
            }
        };

        Self { model, stub }
    }
}

impl<D: Detector> PredictionService<D> {
    pub fn with_detector(detector: D, stub: StubPredictor) -> Self {
        Self {
            model: ModelHandle::Available(detector),
            stub,
        }
    }

    pub fn stub_only(stub: StubPredictor) -> Self {
        Self {
            model: ModelHandle::Unavailable,
            stub,
        }
    }

    pub fn is_detector_available(&self) -> bool {
        matches!(self.model, ModelHandle::Available(_))
    }

    pub fn class_labels(&self) -> &[String] {
        match &self.model {
            ModelHandle::Available(detector) => detector.class_names().as_slice(),
            ModelHandle::Unavailable => &[],
        }
    }

    pub fn stub_seed(&self) -> u64 {
        self.stub.seed()
    }

    /// Never fails: detector errors fall back to the stub for this call.
    #[instrument(skip(self, image_bytes), fields(size = image_bytes.len()))]
    pub fn predict(&self, image_bytes: &[u8]) -> Verdict {
        let detector = match &self.model {
            ModelHandle::Available(detector) => detector,
            ModelHandle::Unavailable => return self.stub.predict(image_bytes),
        };

        match detect_objects(detector, image_bytes) {
            Ok(detections) => {
                let verdict = aggregate(&detections);
                tracing::debug!(
                    "Aggregated {} detections into {} ({:.3})",
                    detections.len(),
                    verdict.label(),
                    verdict.confidence()
                );
                verdict
            }
            Err(e) => {
                tracing::warn!("Detector inference failed ({}); using stub prediction", e);
                self.stub.predict(image_bytes)
            }
        }
    }
}

fn decode_image(image_bytes: &[u8]) -> Result<DynamicImage, DetectorError> {
    let image = image::ImageReader::new(std::io::Cursor::new(image_bytes))
        .with_guessed_format()
        .map_err(|e| DetectorError::Decode(image::ImageError::IoError(e)))?
        .decode()?;
    Ok(image)
}

fn detect_objects<D: Detector>(
    detector: &D,
    image_bytes: &[u8],
) -> Result<Vec<DetectedObject>, DetectorError> {
    let image = decode_image(image_bytes)?;
    let boxes = detector.detect(&image)?;
    to_detected_objects(&boxes, detector.class_names())
}

fn to_detected_objects(
    boxes: &[BoundingBox],
    class_names: &ClassNames,
) -> Result<Vec<DetectedObject>, DetectorError> {
    boxes
        .iter()
        .map(|bbox| {
            if !(0.0..=1.0).contains(&bbox.confidence) {
                return Err(DetectorError::InvalidOutput(format!(
                    "confidence {} of class {} is outside [0, 1]",
                    bbox.confidence, bbox.class_id
                )));
            }
            Ok(DetectedObject::new(
                class_names.name(bbox.class_id),
                f64::from(bbox.confidence),
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{Device, LabelsConfig, LogLevel, ModelConfig, ServerConfig, StubConfig},
        stub::predict_stub,
        verdict::VerdictLabel,
    };
    use image::{ImageBuffer, Rgb};
    use std::io::Cursor;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockDetector {
        class_names: ClassNames,
        result: Result<Vec<BoundingBox>, String>,
        calls: AtomicUsize,
    }

    impl MockDetector {
        fn new(result: Result<Vec<BoundingBox>, String>) -> Self {
            Self {
                class_names: ClassNames::new(vec!["head".to_string(), "helmet".to_string()]),
                result,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Detector for MockDetector {
        fn detect(&self, _image: &DynamicImage) -> Result<Vec<BoundingBox>, DetectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone().map_err(DetectorError::Inference)
        }

        fn class_names(&self) -> &ClassNames {
            &self.class_names
        }
    }

    fn bbox(class_id: usize, confidence: f32) -> BoundingBox {
        BoundingBox {
            class_id,
            confidence,
            x1: 10.0,
            y1: 20.0,
            x2: 100.0,
            y2: 150.0,
        }
    }

    fn png_bytes() -> Vec<u8> {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(32, 32, Rgb([0, 128, 255]));
        let mut cursor = Cursor::new(Vec::new());
        img.write_to(&mut cursor, image::ImageFormat::Png).unwrap();
        cursor.into_inner()
    }

    #[test]
    fn test_detector_verdict() {
        let detector = MockDetector::new(Ok(vec![bbox(0, 0.5), bbox(1, 0.75)]));
        let service = PredictionService::with_detector(detector, StubPredictor::default());

        let verdict = service.predict(&png_bytes());

        assert_eq!(verdict.label(), VerdictLabel::Helmet);
        assert_eq!(verdict.confidence(), 0.625);
    }

    #[test]
    fn test_unknown_class_index_uses_index_as_label() {
        let detector = MockDetector::new(Ok(vec![bbox(0, 0.5), bbox(9, 0.5)]));
        let service = PredictionService::with_detector(detector, StubPredictor::default());

        let verdict = service.predict(&png_bytes());

        assert_eq!(verdict, Verdict::new(VerdictLabel::NoHelmet, 0.5));
    }

    #[test]
    fn test_no_detections_are_uncertain() {
        let detector = MockDetector::new(Ok(vec![]));
        let service = PredictionService::with_detector(detector, StubPredictor::default());

        assert_eq!(service.predict(&png_bytes()), Verdict::uncertain());
    }

    #[test]
    fn test_decode_failure_falls_back_to_stub() {
        let detector = MockDetector::new(Ok(vec![bbox(0, 0.9)]));
        let service = PredictionService::with_detector(detector, StubPredictor::default());

        let bytes = b"not an image";
        assert_eq!(service.predict(bytes), predict_stub(bytes));

        let ModelHandle::Available(detector) = &service.model else {
            panic!("detector should be available");
        };
        assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_inference_failure_falls_back_to_stub() {
        let detector = MockDetector::new(Err("device lost".to_string()));
        let service = PredictionService::with_detector(detector, StubPredictor::default());

        let bytes = png_bytes();
        assert_eq!(service.predict(&bytes), predict_stub(&bytes));
    }

    #[test]
    fn test_malformed_output_falls_back_to_stub() {
        let detector = MockDetector::new(Ok(vec![bbox(0, 1.5)]));
        let service = PredictionService::with_detector(detector, StubPredictor::default());

        let bytes = png_bytes();
        assert_eq!(service.predict(&bytes), predict_stub(&bytes));

        let detector = MockDetector::new(Ok(vec![bbox(0, f32::NAN)]));
        let service = PredictionService::with_detector(detector, StubPredictor::default());
        assert_eq!(service.predict(&bytes), predict_stub(&bytes));
    }

    #[test]
    fn test_failure_is_not_sticky() {
        let detector = MockDetector::new(Ok(vec![bbox(0, 0.6)]));
        let service = PredictionService::with_detector(detector, StubPredictor::default());

        service.predict(b"garbage");
        assert_eq!(
            service.predict(&png_bytes()),
            Verdict::new(VerdictLabel::NoHelmet, 0.6)
        );
        assert!(service.is_detector_available());
    }

    #[test]
    fn test_stub_only_service_is_total() {
        let service = PredictionService::<MockDetector>::stub_only(StubPredictor::default());
        assert!(!service.is_detector_available());
        assert!(service.class_labels().is_empty());

        let png = png_bytes();
        let inputs: [&[u8]; 4] = [b"", b"\x89PNG", &png, &[0u8; 1024]];
        for bytes in inputs {
            let verdict = service.predict(bytes);
            assert_eq!(verdict, predict_stub(bytes));
            assert!((0.0..=1.0).contains(&verdict.confidence()));
        }
    }

    #[test]
    fn test_class_labels_come_from_detector() {
        let service = PredictionService::with_detector(
            MockDetector::new(Ok(vec![])),
            StubPredictor::default(),
        );
        assert_eq!(service.class_labels(), ["head", "helmet"]);
    }

    fn config_for(model_dir: &Path, labels: Option<LabelsConfig>) -> Config {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 50051,
            },
            log_level: LogLevel::Info,
            model: ModelConfig {
                model_dir: model_dir.to_path_buf(),
                onnx_file: Some("helmet.onnx".to_string()),
                num_instances: 1,
                min_probability: 0.25,
                iou_threshold: 0.7,
                device: Device::Cpu,
            },
            labels,
            stub: StubConfig { seed: 3 },
        }
    }

    fn assert_stub_only(service: &PredictionService<OrtDetector>) {
        assert!(!service.is_detector_available());
        assert!(service.class_labels().is_empty());
        assert_eq!(service.stub_seed(), 3);
        assert_eq!(service.predict(b"x"), predict_stub(b"x"));
        assert_eq!(service.predict(&png_bytes()), predict_stub(&png_bytes()));
    }

    #[test]
    fn test_load_with_missing_weights_is_stub_only() {
        let config = config_for(Path::new("./no-such-model-dir"), None);

        assert_stub_only(&PredictionService::load(&config));
    }

    #[test]
    fn test_load_with_corrupt_weights_is_stub_only() {
        let model_dir = tempfile::tempdir().unwrap();
        std::fs::write(model_dir.path().join("helmet.onnx"), b"not an onnx model").unwrap();
        let config = config_for(model_dir.path(), None);

        assert_stub_only(&PredictionService::load(&config));
    }

    #[test]
    fn test_load_with_unreadable_labels_is_stub_only() {
        let model_dir = tempfile::tempdir().unwrap();
        std::fs::write(model_dir.path().join("helmet.onnx"), [0u8; 64]).unwrap();
        let labels = LabelsConfig {
            labels_file: "missing.txt".to_string(),
            labels_dir: PathBuf::from("./no-such-labels-dir"),
        };
        let config = config_for(model_dir.path(), Some(labels));

        assert_stub_only(&PredictionService::load(&config));
    }
}
