use std::fmt;

use serde::Serialize;

use crate::{error::ServiceError, model::Hyperparameters};

/// Storage format of the model weights.
pub trait QuantizationEncoding: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Effective bits per weight, block scales included.
    fn bits_per_weight(&self) -> f64;

    fn is_quantized(&self) -> bool {
        self.bits_per_weight() < 16.0
    }

    fn weight_bytes(&self, parameters: u64) -> u64 {
        (parameters as f64 * self.bits_per_weight() / 8.0).ceil() as u64
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Float32;

#[derive(Debug, Clone, Copy)]
pub struct BFloat16;

/// 32 weights per block: 16 bytes of nibbles plus an f16 scale.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy)]
pub struct Q4_0;

/// 256-weight super-blocks stored in 144 bytes.
#[derive(Debug, Clone, Copy)]
pub struct Q4K;

/// 256-weight super-blocks stored in 210 bytes.
#[derive(Debug, Clone, Copy)]
pub struct Q6K;

impl QuantizationEncoding for Float32 {
    fn name(&self) -> &'static str {
        "float32"
    }

    fn bits_per_weight(&self) -> f64 {
        32.0
    }
}

impl QuantizationEncoding for BFloat16 {
    fn name(&self) -> &'static str {
        "bfloat16"
    }

    fn bits_per_weight(&self) -> f64 {
        16.0
    }
}

impl QuantizationEncoding for Q4_0 {
    fn name(&self) -> &'static str {
        "q4_0"
    }

    fn bits_per_weight(&self) -> f64 {
        18.0 * 8.0 / 32.0
    }
}

impl QuantizationEncoding for Q4K {
    fn name(&self) -> &'static str {
        "q4_k"
    }

    fn bits_per_weight(&self) -> f64 {
        144.0 * 8.0 / 256.0
    }
}

impl QuantizationEncoding for Q6K {
    fn name(&self) -> &'static str {
        "q6_k"
    }

    fn bits_per_weight(&self) -> f64 {
        210.0 * 8.0 / 256.0
    }
}

pub fn parse_encoding(raw: &str) -> Result<Box<dyn QuantizationEncoding>, ServiceError> {
    match raw.trim().to_lowercase().as_str() {
        "float32" | "f32" => Ok(Box::new(Float32)),
        "bfloat16" | "bf16" => Ok(Box::new(BFloat16)),
        "q4_0" => Ok(Box::new(Q4_0)),
        "q4_k" | "q4_k_m" => Ok(Box::new(Q4K)),
        "q6_k" => Ok(Box::new(Q6K)),
        other => Err(ServiceError::Configuration(format!(
            "unknown quantization encoding '{other}'"
        ))),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuantizationSummary {
    pub encoding: String,
    pub quantized: bool,
    pub parameter_count: u64,
    pub float32_size_bytes: u64,
    pub encoded_size_bytes: u64,
    pub size_reduction_percent: f64,
}

impl QuantizationSummary {
    pub fn estimate(
        hyperparams: &Hyperparameters,
        encoding: &dyn QuantizationEncoding,
    ) -> QuantizationSummary {
        let parameter_count = hyperparams.parameter_count();
        let baseline = Float32.weight_bytes(parameter_count);
        let encoded = encoding.weight_bytes(parameter_count);
        let reduction = if baseline == 0 {
            0.0
        } else {
            let diff = baseline.saturating_sub(encoded) as f64;
            (diff / baseline as f64) * 100.0
        };

        QuantizationSummary {
            encoding: encoding.name().to_string(),
            quantized: encoding.is_quantized(),
            parameter_count,
            float32_size_bytes: baseline,
            encoded_size_bytes: encoded,
            size_reduction_percent: reduction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::hyperparams::RawHyperparameters;

    #[test]
    fn parses_known_encodings_case_insensitively() {
        assert_eq!(parse_encoding("Q4_K").unwrap().name(), "q4_k");
        assert_eq!(parse_encoding("bf16").unwrap().name(), "bfloat16");
        assert!(!parse_encoding("float32").unwrap().is_quantized());
        assert!(parse_encoding("q6_k").unwrap().is_quantized());
    }

    #[test]
    fn unknown_encoding_is_a_configuration_error() {
        let err = parse_encoding("int3").unwrap_err();
        assert!(matches!(err, ServiceError::Configuration(_)));
    }

    #[test]
    fn q4_0_is_four_and_a_half_bits() {
        assert!((Q4_0.bits_per_weight() - 4.5).abs() < 1e-9);
        assert_eq!(Q4_0.weight_bytes(64), 36);
    }

    #[test]
    fn summary_reports_size_reduction() {
        let hp = Hyperparameters::new(RawHyperparameters {
            embedding_dim: 64,
            n_layers: 2,
            n_heads: 4,
            n_kv_heads: Some(2),
            head_dim: None,
            norm_eps: 1e-5,
            vocab_size: 100,
            feed_forward_dim: Some(128),
        })
        .unwrap();

        let summary = QuantizationSummary::estimate(&hp, &Q4K);
        assert_eq!(summary.encoding, "q4_k");
        assert!(summary.quantized);
        assert_eq!(summary.float32_size_bytes, hp.parameter_count() * 4);
        assert!((summary.size_reduction_percent - 85.9375).abs() < 0.01);
    }
}
