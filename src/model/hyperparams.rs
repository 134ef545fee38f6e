use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// Model dimensions as they appear on disk. Accepts the HuggingFace
/// `config.json` spellings.
#[derive(Debug, Clone, Deserialize)]
pub struct RawHyperparameters {
    #[serde(alias = "hidden_size", alias = "dim")]
    pub embedding_dim: usize,
    #[serde(alias = "num_hidden_layers")]
    pub n_layers: usize,
    #[serde(alias = "num_attention_heads")]
    pub n_heads: usize,
    #[serde(default, alias = "num_key_value_heads")]
    pub n_kv_heads: Option<usize>,
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default = "default_norm_eps", alias = "rms_norm_eps")]
    pub norm_eps: f64,
    pub vocab_size: usize,
    #[serde(default, alias = "intermediate_size", alias = "hidden_dim")]
    pub feed_forward_dim: Option<usize>,
}

fn default_norm_eps() -> f64 {
    1e-5
}

/// Immutable model dimensions with derived values computed once at load.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hyperparameters {
    embedding_dim: usize,
    n_layers: usize,
    n_heads: usize,
    n_kv_heads: usize,
    head_dim: usize,
    n_rep: usize,
    norm_eps: f64,
    vocab_size: usize,
    feed_forward_dim: usize,
}

impl Hyperparameters {
    pub fn new(raw: RawHyperparameters) -> Result<Self, ServiceError> {
        let invalid = |msg: String| ServiceError::Configuration(format!("hyperparameters: {msg}"));

        for (name, value) in [
            ("embedding_dim", raw.embedding_dim),
            ("n_layers", raw.n_layers),
            ("n_heads", raw.n_heads),
            ("vocab_size", raw.vocab_size),
        ] {
            if value == 0 {
                return Err(invalid(format!("{name} must be positive")));
            }
        }

        let n_kv_heads = raw.n_kv_heads.unwrap_or(raw.n_heads);
        if n_kv_heads == 0 || raw.n_heads % n_kv_heads != 0 {
            return Err(invalid(format!(
                "n_heads ({}) must be a multiple of n_kv_heads ({n_kv_heads})",
                raw.n_heads
            )));
        }

        let head_dim = match raw.head_dim {
            Some(0) => return Err(invalid("head_dim must be positive".into())),
            Some(dim) => dim,
            None if raw.embedding_dim % raw.n_heads == 0 => raw.embedding_dim / raw.n_heads,
            None => {
                return Err(invalid(format!(
                    "embedding_dim ({}) is not divisible by n_heads ({})",
                    raw.embedding_dim, raw.n_heads
                )));
            }
        };

        if !raw.norm_eps.is_finite() || raw.norm_eps <= 0.0 {
            return Err(invalid(format!("norm_eps must be positive, got {}", raw.norm_eps)));
        }

        Ok(Self {
            embedding_dim: raw.embedding_dim,
            n_layers: raw.n_layers,
            n_heads: raw.n_heads,
            n_kv_heads,
            head_dim,
            n_rep: raw.n_heads / n_kv_heads,
            norm_eps: raw.norm_eps,
            vocab_size: raw.vocab_size,
            feed_forward_dim: raw.feed_forward_dim.unwrap_or(4 * raw.embedding_dim),
        })
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ServiceError> {
        let raw = fs::read_to_string(path)?;
        let parsed: RawHyperparameters = serde_json::from_str(&raw).map_err(|e| {
            ServiceError::Configuration(format!("invalid hyperparameters file {}: {e}", path.display()))
        })?;
        Self::new(parsed)
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    pub fn n_layers(&self) -> usize {
        self.n_layers
    }

    pub fn n_heads(&self) -> usize {
        self.n_heads
    }

    pub fn n_kv_heads(&self) -> usize {
        self.n_kv_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// How many query heads share one key/value head.
    pub fn n_rep(&self) -> usize {
        self.n_rep
    }

    pub fn norm_eps(&self) -> f64 {
        self.norm_eps
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn feed_forward_dim(&self) -> usize {
        self.feed_forward_dim
    }

    /// Approximate weight count of a llama-style decoder with untied
    /// embeddings. Norm weights are included; biases are not.
    pub fn parameter_count(&self) -> u64 {
        let embed = self.embedding_dim as u64;
        let q_dim = (self.n_heads * self.head_dim) as u64;
        let kv_dim = (self.n_kv_heads * self.head_dim) as u64;
        let ffn = self.feed_forward_dim as u64;
        let vocab = self.vocab_size as u64;

        let attention = embed * q_dim + 2 * embed * kv_dim + q_dim * embed;
        let mlp = 3 * embed * ffn;
        let norms = 2 * embed;
        let per_layer = attention + mlp + norms;

        2 * vocab * embed + self.n_layers as u64 * per_layer + embed
    }
}
