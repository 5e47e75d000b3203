use crate::{
    config::Config, detector::Detector, inference_service::InferenceService,
    prediction::PredictionService,
};
use helmet_proto::helmet_service_server::HelmetServiceServer;
use std::net::SocketAddr;
use tokio::signal;
use tonic::transport::server::Router;
use tonic::transport::Server;
use tonic_health::server::HealthReporter;

pub struct GrpcServer<D: Detector> {
    router: Router,
    health_reporter: HealthReporter,
    addr: String,
    _detector: std::marker::PhantomData<D>,
}

impl<D: Detector> GrpcServer<D> {
    pub fn new(
        prediction_service: PredictionService<D>,
        addr: &str,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let inference_service = InferenceService::new(prediction_service);
        let (health_reporter, health_service) = tonic_health::server::health_reporter();
        let reflection_service = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(helmet_proto::FILE_DESCRIPTOR_SET)
            .build_v1alpha()?;
        let router = Server::builder()
            .add_service(health_service)
            .add_service(HelmetServiceServer::new(inference_service))
            .add_service(reflection_service);

        Ok(Self {
            router,
            health_reporter,
            addr: addr.to_string(),
            _detector: std::marker::PhantomData,
        })
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let addr: SocketAddr = self.addr.parse()?;

        self.health_reporter
            .set_serving::<HelmetServiceServer<InferenceService<D>>>()
            .await;
        tracing::info!("Inference service listening on {}", self.addr);

        let health_reporter = self.health_reporter.clone();
        let shutdown = async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, starting graceful shutdown");
            health_reporter
                .set_not_serving::<HelmetServiceServer<InferenceService<D>>>()
                .await;
        };

        self.router.serve_with_shutdown(addr, shutdown).await?;
        Ok(())
    }
}

pub async fn start_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let load_config = config.clone();
    let prediction_service =
        tokio::task::spawn_blocking(move || PredictionService::load(&load_config)).await?;
    if !prediction_service.is_detector_available() {
        tracing::warn!("Serving stub predictions only");
    }

    let addr = config.server.get_address();
    let grpc_server = GrpcServer::new(prediction_service, &addr)?;

    grpc_server.run().await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
