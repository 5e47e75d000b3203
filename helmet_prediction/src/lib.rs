mod inference_service;
mod server;

pub mod aggregator;
pub mod config;
pub mod detector;
pub mod labels;
pub mod ort_detector;
pub mod prediction;
pub mod stub;
pub mod verdict;

pub use prediction::{ModelHandle, PredictionService};
pub use server::start_server;
pub use verdict::{DetectedObject, Verdict, VerdictLabel};
