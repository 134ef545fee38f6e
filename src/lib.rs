pub mod config;
pub mod error;
pub mod evaluation;
pub mod model;
pub mod quantization;
pub mod server;
pub mod service;

pub use config::AppConfig;
pub use error::ServiceError;
pub use evaluation::{BenchmarkSample, EvaluationReport};
pub use model::{ChatCompletion, ChatRequest, ModelArtifacts};
pub use server::build_router;
pub use service::{GenerationDefaults, InferenceService};
