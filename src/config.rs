use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
};

use crate::{error::ServiceError, model::SamplerParams, quantization::parse_encoding};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub model_name: String,
    pub model_path: PathBuf,
    pub hyperparams_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub custom_ops_paths: Vec<PathBuf>,
    pub quantization_encoding: String,
    pub batch_size: usize,
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub min_p: f64,
    pub seed: Option<u64>,
    pub use_gpu: bool,
    pub prompt: Option<String>,
    pub prompt_prefix: Option<String>,
    pub eos_token_ids: Option<Vec<u32>>,
    pub eval_prompts_path: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key/value source. Absent or unparseable
    /// values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = lookup("SERVER_ADDR")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080));

        let model_name = lookup("MODEL_NAME").unwrap_or_else(|| "llama3".to_string());
        let model_path =
            PathBuf::from(lookup("MODEL_PATH").unwrap_or_else(|| "models/model.ts".to_string()));
        let hyperparams_path = PathBuf::from(
            lookup("MODEL_CONFIG_PATH").unwrap_or_else(|| "models/config.json".to_string()),
        );
        let tokenizer_path = PathBuf::from(
            lookup("TOKENIZER_PATH").unwrap_or_else(|| "models/tokenizer.json".to_string()),
        );
        let custom_ops_paths = lookup("CUSTOM_OPS_PATHS")
            .map(|raw| env::split_paths(&raw).filter(|p| !p.as_os_str().is_empty()).collect())
            .unwrap_or_default();

        let quantization_encoding =
            lookup("QUANTIZATION_ENCODING").unwrap_or_else(|| "float32".to_string());
        let batch_size = parse_var(&lookup, "BATCH_SIZE").unwrap_or(1);
        let max_new_tokens = parse_var(&lookup, "MAX_NEW_TOKENS").unwrap_or(256);
        let temperature = parse_var(&lookup, "TEMPERATURE").unwrap_or(0.5);
        let min_p = parse_var(&lookup, "MIN_P").unwrap_or(0.05);
        let seed = parse_var(&lookup, "SEED");
        let use_gpu = lookup("USE_GPU")
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let prompt = lookup("PROMPT").filter(|p| !p.is_empty());
        let prompt_prefix = lookup("PROMPT_PREFIX");
        let eos_token_ids = lookup("EOS_TOKEN_IDS").and_then(|raw| {
            raw.split(',')
                .map(|id| id.trim().parse().ok())
                .collect::<Option<Vec<u32>>>()
        });

        let eval_prompts_path = lookup("EVAL_PROMPTS_PATH").map(PathBuf::from);

        Self {
            listen_addr,
            model_name,
            model_path,
            hyperparams_path,
            tokenizer_path,
            custom_ops_paths,
            quantization_encoding,
            batch_size,
            max_new_tokens,
            temperature,
            min_p,
            seed,
            use_gpu,
            prompt,
            prompt_prefix,
            eos_token_ids,
            eval_prompts_path,
        }
    }

    pub fn sampler_params(&self) -> SamplerParams {
        SamplerParams {
            temperature: self.temperature,
            min_p: self.min_p,
        }
    }

    /// Rejects values no generation could run with.
    pub fn validate(&self) -> Result<(), ServiceError> {
        self.sampler_params().validate()?;
        if self.max_new_tokens == 0 {
            return Err(ServiceError::Configuration("MAX_NEW_TOKENS must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(ServiceError::Configuration("BATCH_SIZE must be at least 1".into()));
        }
        parse_encoding(&self.quantization_encoding)?;
        if let Some(missing) = self.custom_ops_paths.iter().find(|p| !p.exists()) {
            return Err(ServiceError::Configuration(format!(
                "custom op library not found: {}",
                missing.display()
            )));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> AppConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = config(&[]);
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.batch_size, 1);
        assert_eq!(cfg.max_new_tokens, 256);
        assert_eq!(cfg.seed, None);
        assert!(!cfg.use_gpu);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn reads_overrides() {
        let cfg = config(&[
            ("TEMPERATURE", "0.9"),
            ("MIN_P", "0.1"),
            ("SEED", "42"),
            ("USE_GPU", "true"),
            ("QUANTIZATION_ENCODING", "q4_k"),
            ("EOS_TOKEN_IDS", "2, 128009"),
            ("PROMPT", "I believe the meaning of life is"),
        ]);
        assert_eq!(cfg.temperature, 0.9);
        assert_eq!(cfg.min_p, 0.1);
        assert_eq!(cfg.seed, Some(42));
        assert!(cfg.use_gpu);
        assert_eq!(cfg.eos_token_ids, Some(vec![2, 128009]));
        assert_eq!(cfg.prompt.as_deref(), Some("I believe the meaning of life is"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn unparseable_values_fall_back_to_defaults() {
        let cfg = config(&[("MAX_NEW_TOKENS", "lots"), ("SERVER_ADDR", "nowhere")]);
        assert_eq!(cfg.max_new_tokens, 256);
        assert_eq!(cfg.listen_addr.port(), 8080);
    }

    #[test]
    fn rejects_bad_sampling_values() {
        assert!(matches!(
            config(&[("TEMPERATURE", "0")]).validate(),
            Err(ServiceError::Configuration(_))
        ));
        assert!(matches!(
            config(&[("MIN_P", "-0.1")]).validate(),
            Err(ServiceError::Configuration(_))
        ));
        assert!(matches!(
            config(&[("MAX_NEW_TOKENS", "0")]).validate(),
            Err(ServiceError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_unknown_encoding_and_missing_custom_ops() {
        assert!(config(&[("QUANTIZATION_ENCODING", "int2")]).validate().is_err());
        assert!(
            config(&[("CUSTOM_OPS_PATHS", "/definitely/not/here.so")])
                .validate()
                .is_err()
        );
    }
}
