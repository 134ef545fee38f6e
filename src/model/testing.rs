//! In-memory engine and tokenizer for exercising the decode loop.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::{
    error::ServiceError,
    model::{
        ExecutionEngine, ExecutionInputs, ExecutionOutputs, Hyperparameters, HostTensor,
        Tokenizer, hyperparams::RawHyperparameters,
    },
    quantization::{Float32, QuantizationEncoding},
};

pub(crate) const BOS: u32 = 1;
pub(crate) const EOT: u32 = 2;
pub(crate) const HELLO: u32 = 15043;
pub(crate) const VOCAB: usize = 16_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StepRecord {
    pub seq_len: usize,
    pub cache_len: usize,
}

/// Favours `transitions[last]` (default `last + 1`) with a runner-up one id
/// above it, so greedy and sampled decoding both have something to do.
pub(crate) struct ScriptedEngine {
    hyperparams: Hyperparameters,
    transitions: HashMap<u32, u32>,
    fail_on_call: Option<usize>,
    calls: Mutex<Vec<StepRecord>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            hyperparams: Hyperparameters::new(RawHyperparameters {
                embedding_dim: 8,
                n_layers: 2,
                n_heads: 2,
                n_kv_heads: Some(1),
                head_dim: Some(2),
                norm_eps: 1e-5,
                vocab_size: VOCAB,
                feed_forward_dim: Some(16),
            })
            .unwrap(),
            transitions: HashMap::new(),
            fail_on_call: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_transition(mut self, from: u32, to: u32) -> Self {
        self.transitions.insert(from, to);
        self
    }

    /// The zero-based call index that returns an execution error.
    pub fn failing_on_call(mut self, call: usize) -> Self {
        self.fail_on_call = Some(call);
        self
    }

    pub fn calls(&self) -> Vec<StepRecord> {
        self.calls.lock().clone()
    }

    fn favoured(&self, last: u32) -> u32 {
        self.transitions
            .get(&last)
            .copied()
            .unwrap_or_else(|| (last + 1) % (VOCAB as u32 - 1))
    }
}

impl ExecutionEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn hyperparams(&self) -> &Hyperparameters {
        &self.hyperparams
    }

    fn encoding(&self) -> &dyn QuantizationEncoding {
        &Float32
    }

    fn execute(&self, inputs: ExecutionInputs<'_>) -> Result<ExecutionOutputs, ServiceError> {
        let call = {
            let mut calls = self.calls.lock();
            calls.push(StepRecord {
                seq_len: inputs.tokens.seq_len(),
                cache_len: inputs.cache_keys.len(),
            });
            calls.len() - 1
        };
        if self.fail_on_call == Some(call) {
            return Err(ServiceError::Execution(format!("scripted failure on call {call}")));
        }

        let [batch, seq_len] = inputs.tokens.shape();
        let ids = inputs.tokens.ids();

        let mut logits = vec![0.0f32; batch * VOCAB];
        for row in 0..batch {
            let last = ids[row * seq_len + seq_len - 1] as u32;
            let favoured = self.favoured(last) as usize;
            logits[row * VOCAB + favoured] = 10.0;
            logits[row * VOCAB + (favoured + 1) % VOCAB] = 9.5;
        }

        // Each cached position records the token id that produced it.
        let hp = &self.hyperparams;
        let per_row = hp.n_layers() * hp.n_kv_heads() * hp.head_dim();
        let mut kv = Vec::with_capacity(seq_len * batch * per_row);
        for pos in 0..seq_len {
            for _layer in 0..hp.n_layers() {
                for row in 0..batch {
                    let id = ids[row * seq_len + pos] as f32;
                    kv.extend(std::iter::repeat(id).take(hp.n_kv_heads() * hp.head_dim()));
                }
            }
        }
        let kv_shape = vec![
            seq_len,
            hp.n_layers(),
            batch,
            hp.n_kv_heads(),
            hp.head_dim(),
        ];

        Ok(ExecutionOutputs {
            logits: HostTensor::new(vec![batch, VOCAB], logits)?,
            new_keys: HostTensor::new(kv_shape.clone(), kv.clone())?,
            new_values: HostTensor::new(kv_shape, kv)?,
        })
    }
}

/// Whitespace tokenizer: BOS, then `Hello` -> 15043 and any other word -> 100 + len.
pub(crate) struct ScriptedTokenizer;

impl Tokenizer for ScriptedTokenizer {
    fn encode(&self, text: &str, prefix: Option<&str>) -> Result<Vec<u32>, ServiceError> {
        let mut ids = vec![BOS];
        let joined;
        let text = match prefix {
            Some(prefix) => {
                joined = format!("{prefix}{text}");
                joined.as_str()
            }
            None => text,
        };
        for word in text.split_whitespace() {
            ids.push(match word {
                "Hello" => HELLO,
                other => 100 + other.len() as u32,
            });
        }
        Ok(ids)
    }

    fn decode(&self, token_id: u32) -> Result<String, ServiceError> {
        Ok(format!(" t{token_id}"))
    }

    fn is_end_of_text(&self, token_id: u32) -> bool {
        token_id == EOT
    }
}

/// Byte-level tokenizer: ids below 256 are raw UTF-8 bytes, so one character
/// may span several tokens.
pub(crate) struct ByteTokenizer;

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str, _prefix: Option<&str>) -> Result<Vec<u32>, ServiceError> {
        Ok(std::iter::once(BOS)
            .chain(text.bytes().map(u32::from))
            .collect())
    }

    fn decode(&self, token_id: u32) -> Result<String, ServiceError> {
        self.decode_sequence(&[token_id])
    }

    fn decode_sequence(&self, token_ids: &[u32]) -> Result<String, ServiceError> {
        let bytes = token_ids
            .iter()
            .map(|&id| {
                u8::try_from(id)
                    .map_err(|_| ServiceError::Tokenizer(format!("{id} is not a byte token")))
            })
            .collect::<Result<Vec<u8>, _>>()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn is_end_of_text(&self, token_id: u32) -> bool {
        token_id == EOT
    }
}
