use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::info;

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{ExecutionEngine, HfTokenizer, Hyperparameters, Tokenizer},
    quantization::parse_encoding,
};

/// Process-lifetime model state shared by every request.
pub struct ModelArtifacts {
    pub engine: Arc<dyn ExecutionEngine>,
    pub tokenizer: Arc<dyn Tokenizer>,
    pub load_time: Duration,
}

impl ModelArtifacts {
    pub fn load(config: &AppConfig) -> Result<Self, ServiceError> {
        let started = Instant::now();

        let tokenizer = Arc::new(HfTokenizer::from_file(
            config.tokenizer_path.as_path(),
            config.eos_token_ids.clone(),
        )?);
        info!(
            path = %config.tokenizer_path.display(),
            end_of_text = ?tokenizer.end_of_text_ids(),
            "loaded tokenizer"
        );

        let hyperparams = Hyperparameters::from_json_file(&config.hyperparams_path)?;
        let encoding = parse_encoding(&config.quantization_encoding)?;
        let engine = load_engine(config, hyperparams, encoding)?;

        Ok(Self {
            engine,
            tokenizer,
            load_time: started.elapsed(),
        })
    }
}

#[cfg(feature = "tch-backend")]
fn load_engine(
    config: &AppConfig,
    hyperparams: Hyperparameters,
    encoding: Box<dyn crate::quantization::QuantizationEncoding>,
) -> Result<Arc<dyn ExecutionEngine>, ServiceError> {
    let engine = crate::model::tch_backend::TorchScriptEngine::load(
        &config.model_name,
        &config.model_path,
        hyperparams,
        encoding,
        config.custom_ops_paths.clone(),
        config.use_gpu,
    )?;
    Ok(Arc::new(engine))
}

#[cfg(not(feature = "tch-backend"))]
fn load_engine(
    _config: &AppConfig,
    _hyperparams: Hyperparameters,
    _encoding: Box<dyn crate::quantization::QuantizationEncoding>,
) -> Result<Arc<dyn ExecutionEngine>, ServiceError> {
    Err(ServiceError::Configuration(
        "no execution backend compiled in; rebuild with `--features tch-backend`".into(),
    ))
}
