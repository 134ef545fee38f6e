pub mod engine;
pub mod generation;
pub mod hyperparams;
pub mod kv_cache;
mod loader;
pub mod sampler;
pub mod tensor;
pub mod tokenizer;
mod types;

#[cfg(feature = "tch-backend")]
pub mod tch_backend;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{ExecutionEngine, ExecutionInputs, ExecutionOutputs, ModelMetadata};
pub use generation::{
    FinishReason, GeneratedToken, Generation, GenerationConfig, GenerationMetrics, MetricsReport,
};
pub use hyperparams::Hyperparameters;
pub use kv_cache::{CacheView, KvCache};
pub use loader::ModelArtifacts;
pub use sampler::{Sampler, SamplerParams};
pub use tensor::{HostTensor, TokenBatch};
pub use tokenizer::{HfTokenizer, Tokenizer};
pub use types::{
    ChatChoice, ChatCompletion, ChatCompletionChunk, ChatMessage, ChatRequest, ChunkChoice,
    Delta, Usage,
};
