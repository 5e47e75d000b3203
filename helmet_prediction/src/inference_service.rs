use crate::{detector::Detector, prediction::PredictionService};
use helmet_proto::{
    helmet_service_server::HelmetService, Empty, ImageFrame, ModelStatus,
    Verdict as VerdictMessage,
};
use std::sync::Arc;
use tonic::{async_trait, Request, Response, Status};
use tracing::instrument;

pub struct InferenceService<D: Detector> {
    prediction_service: Arc<PredictionService<D>>,
}

impl<D: Detector> InferenceService<D> {
    pub fn new(prediction_service: PredictionService<D>) -> Self {
        Self {
            prediction_service: Arc::new(prediction_service),
        }
    }
}

#[async_trait]
impl<D: Detector> HelmetService for InferenceService<D> {
    #[instrument(skip(self, request))]
    async fn predict(
        &self,
        request: Request<ImageFrame>,
    ) -> Result<Response<VerdictMessage>, Status> {
        let image_frame = request.into_inner();
        let timestamp = image_frame.timestamp;
        let prediction_service = self.prediction_service.clone();

        let verdict =
            tokio::task::spawn_blocking(move || prediction_service.predict(&image_frame.image_data))
                .await
                .map_err(|e| Status::internal(format!("prediction task failed: {}", e)))?;

        tracing::debug!(
            "Returning verdict {} with confidence {:.3} for frame {}",
            verdict.label(),
            verdict.confidence(),
            timestamp
        );

        let mut response: VerdictMessage = verdict.into();
        response.timestamp = timestamp;
        Ok(Response::new(response))
    }

    async fn get_model_status(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<ModelStatus>, Status> {
        let response = ModelStatus {
            detector_available: self.prediction_service.is_detector_available(),
            class_labels: self.prediction_service.class_labels().to_vec(),
            stub_seed: self.prediction_service.stub_seed(),
        };

        Ok(Response::new(response))
    }
}
