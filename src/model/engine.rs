use serde::Serialize;

use crate::{
    error::ServiceError,
    model::{
        Hyperparameters,
        kv_cache::CacheView,
        tensor::{HostTensor, TokenBatch},
    },
    quantization::QuantizationEncoding,
};

pub const INPUT_TOKENS: &str = "tokens";
pub const INPUT_CACHE_KEYS: &str = "cache_keys";
pub const INPUT_CACHE_VALUES: &str = "cache_values";
pub const OUTPUT_LOGITS: &str = "logits";
pub const OUTPUT_NEW_KEYS: &str = "new_keys";
pub const OUTPUT_NEW_VALUES: &str = "new_values";

/// Named inputs of one execution step.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionInputs<'a> {
    /// `[batch_size, seq_len]`
    pub tokens: &'a TokenBatch,
    /// Cache state before this step.
    pub cache_keys: CacheView<'a>,
    pub cache_values: CacheView<'a>,
}

/// Named outputs of one execution step.
#[derive(Debug, Clone)]
pub struct ExecutionOutputs {
    /// `[batch_size, vocab_size]`, scores for the position after the last input token.
    pub logits: HostTensor,
    /// `[seq_len, n_layers, batch_size, n_kv_heads, head_dim]`
    pub new_keys: HostTensor,
    pub new_values: HostTensor,
}

/// A compiled model that can run one forward step.
///
/// Implementations are shared read-only across requests; per-request state
/// lives in the caller's [`KvCache`](crate::model::KvCache).
pub trait ExecutionEngine: Send + Sync {
    fn name(&self) -> &str;

    fn hyperparams(&self) -> &Hyperparameters;

    fn encoding(&self) -> &dyn QuantizationEncoding;

    fn execute(&self, inputs: ExecutionInputs<'_>) -> Result<ExecutionOutputs, ServiceError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelMetadata {
    pub name: String,
    pub encoding: String,
    pub hyperparams: Hyperparameters,
}

impl ModelMetadata {
    pub fn describe(engine: &dyn ExecutionEngine) -> Self {
        Self {
            name: engine.name().to_string(),
            encoding: engine.encoding().name().to_string(),
            hyperparams: engine.hyperparams().clone(),
        }
    }
}

impl ExecutionOutputs {
    /// Checks the output shapes against what the step was fed.
    pub fn validate(&self, inputs: &ExecutionInputs<'_>, vocab_size: usize) -> Result<(), ServiceError> {
        let batch = inputs.tokens.batch_size();
        if self.logits.shape() != [batch, vocab_size] {
            return Err(ServiceError::Execution(format!(
                "output '{OUTPUT_LOGITS}' has shape {:?}, expected [{batch}, {vocab_size}]",
                self.logits.shape()
            )));
        }

        let seq_len = inputs.tokens.seq_len();
        for (name, tensor) in [
            (OUTPUT_NEW_KEYS, &self.new_keys),
            (OUTPUT_NEW_VALUES, &self.new_values),
        ] {
            if tensor.shape().first() != Some(&seq_len) {
                return Err(ServiceError::Execution(format!(
                    "output '{name}' has shape {:?}, expected {seq_len} new positions",
                    tensor.shape()
                )));
            }
        }
        Ok(())
    }
}
