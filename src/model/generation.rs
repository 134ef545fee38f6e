//! The decode loop: one prefill step over the whole prompt, then one step per
//! sampled token until end-of-text or the cache is full.
//!
//! [`Generation`] is a lazy iterator over generated tokens. Draining it
//! eagerly or chunk by chunk yields the same ids for the same seed.

use std::{
    iter::FusedIterator,
    time::{Duration, Instant},
};

use serde::Serialize;
use tracing::{debug, error, info, info_span, trace};

use crate::{
    error::ServiceError,
    model::{
        ExecutionEngine, ExecutionInputs, KvCache, Tokenizer,
        sampler::{Sampler, SamplerParams},
        tensor::TokenBatch,
    },
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationConfig {
    /// Total sequence positions the engine may be fed; also the cache capacity.
    pub max_tokens: usize,
    pub batch_size: usize,
    pub sampler: SamplerParams,
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FinishReason {
    #[serde(rename = "stop")]
    EndOfText,
    #[serde(rename = "length")]
    Length,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedToken {
    pub id: u32,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Prefill,
    Generate { last: u32 },
    Done,
}

/// Timing and counters for one run. Written only by the decode loop.
#[derive(Debug, Clone, Default)]
pub struct GenerationMetrics {
    startup: Duration,
    prompt_tokens: usize,
    steps: usize,
    generated_tokens: usize,
    time_to_first_token: Option<Duration>,
    token_times: Vec<Duration>,
    total: Option<Duration>,
}

impl GenerationMetrics {
    /// Time spent validating inputs and allocating the cache.
    pub fn startup(&self) -> Duration {
        self.startup
    }

    pub fn prompt_tokens(&self) -> usize {
        self.prompt_tokens
    }

    /// Execution steps run so far, prefill included.
    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn generated_tokens(&self) -> usize {
        self.generated_tokens
    }

    pub fn time_to_first_token(&self) -> Option<Duration> {
        self.time_to_first_token
    }

    /// Duration of each single-token step after prefill.
    pub fn token_times(&self) -> &[Duration] {
        &self.token_times
    }

    /// Set once the loop reaches `Done`.
    pub fn total(&self) -> Option<Duration> {
        self.total
    }

    pub fn report(&self) -> MetricsReport {
        let total = self.total.unwrap_or_default();
        let mean_token_ms = if self.token_times.is_empty() {
            None
        } else {
            let sum: Duration = self.token_times.iter().sum();
            Some(millis(sum) / self.token_times.len() as f64)
        };
        let tokens_per_second = if total.as_secs_f64() > 0.0 {
            self.generated_tokens as f64 / total.as_secs_f64()
        } else {
            0.0
        };

        MetricsReport {
            startup_ms: millis(self.startup),
            prompt_tokens: self.prompt_tokens,
            time_to_first_token_ms: self.time_to_first_token.map(millis),
            generated_tokens: self.generated_tokens,
            mean_token_ms,
            tokens_per_second,
            total_ms: millis(total),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub startup_ms: f64,
    pub prompt_tokens: usize,
    pub time_to_first_token_ms: Option<f64>,
    pub generated_tokens: usize,
    pub mean_token_ms: Option<f64>,
    pub tokens_per_second: f64,
    pub total_ms: f64,
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1_000.0
}

/// Which tokens have been turned into text.
///
/// Each new token is decoded together with the last emitted one, and text is
/// released only once it no longer ends in a partial character. Byte-level
/// vocabularies split multi-byte characters across tokens.
#[derive(Debug, Clone, Copy)]
struct TextCursor {
    prev: usize,
    current: usize,
}

impl TextCursor {
    /// Starts with the last prompt token as decoding context.
    fn new(prompt_len: usize) -> Self {
        Self {
            prev: prompt_len.saturating_sub(1),
            current: prompt_len,
        }
    }

    /// Text completed by the newest token; empty while a character is partial.
    fn advance(&mut self, tokenizer: &dyn Tokenizer, tokens: &[u32]) -> Result<String, ServiceError> {
        let (prev_text, text) = self.window(tokenizer, tokens)?;
        match text.get(prev_text.len()..) {
            Some(fresh) if !fresh.is_empty() && !fresh.ends_with(char::REPLACEMENT_CHARACTER) => {
                let fresh = fresh.to_string();
                self.prev = self.current;
                self.current = tokens.len();
                Ok(fresh)
            }
            _ => Ok(String::new()),
        }
    }

    /// Releases whatever is still held back, partial characters included.
    fn flush(&mut self, tokenizer: &dyn Tokenizer, tokens: &[u32]) -> Result<String, ServiceError> {
        if self.current == tokens.len() {
            return Ok(String::new());
        }
        let (prev_text, text) = self.window(tokenizer, tokens)?;
        self.prev = self.current;
        self.current = tokens.len();
        Ok(text.get(prev_text.len()..).unwrap_or_default().to_string())
    }

    fn window(&self, tokenizer: &dyn Tokenizer, tokens: &[u32]) -> Result<(String, String), ServiceError> {
        let prev_text = tokenizer.decode_sequence(&tokens[self.prev..self.current])?;
        let text = tokenizer.decode_sequence(&tokens[self.prev..])?;
        Ok((prev_text, text))
    }
}

pub struct Generation<'a> {
    engine: &'a dyn ExecutionEngine,
    tokenizer: &'a dyn Tokenizer,
    cache: KvCache,
    sampler: Sampler,
    batch_size: usize,
    tokens: Vec<u32>,
    prompt_len: usize,
    text: TextCursor,
    phase: Phase,
    finish_reason: Option<FinishReason>,
    metrics: GenerationMetrics,
    started: Instant,
    span: tracing::Span,
}

impl<'a> Generation<'a> {
    /// Validates the request and allocates its cache. No execution happens here.
    pub fn new(
        engine: &'a dyn ExecutionEngine,
        tokenizer: &'a dyn Tokenizer,
        prompt: Vec<u32>,
        config: GenerationConfig,
    ) -> Result<Self, ServiceError> {
        let started = Instant::now();

        if prompt.is_empty() {
            return Err(ServiceError::Configuration("prompt encodes to zero tokens".into()));
        }
        if prompt.len() > config.max_tokens {
            return Err(ServiceError::Configuration(format!(
                "prompt of {} tokens does not fit max_tokens {}",
                prompt.len(),
                config.max_tokens
            )));
        }

        let sampler = Sampler::new(config.sampler, config.seed)?;
        let cache = KvCache::create(engine.hyperparams(), config.max_tokens, config.batch_size)?;

        let prompt_len = prompt.len();
        let span = info_span!(
            "generation",
            model = engine.name(),
            prompt_tokens = prompt_len,
            max_tokens = config.max_tokens
        );

        Ok(Self {
            engine,
            tokenizer,
            cache,
            sampler,
            batch_size: config.batch_size,
            tokens: prompt,
            prompt_len,
            text: TextCursor::new(prompt_len),
            phase: Phase::Prefill,
            finish_reason: None,
            metrics: GenerationMetrics {
                startup: started.elapsed(),
                prompt_tokens: prompt_len,
                ..GenerationMetrics::default()
            },
            started,
            span,
        })
    }

    /// Prompt followed by every emitted token.
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    pub fn generated(&self) -> &[u32] {
        &self.tokens[self.prompt_len..]
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }

    pub fn cache(&self) -> &KvCache {
        &self.cache
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// `None` while running, or after an execution failure.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    pub fn metrics(&self) -> &GenerationMetrics {
        &self.metrics
    }

    fn step(&mut self, input: &TokenBatch) -> Result<Option<GeneratedToken>, ServiceError> {
        let step_started = Instant::now();
        let prefill = self.phase == Phase::Prefill;

        let inputs = ExecutionInputs {
            tokens: input,
            cache_keys: self.cache.keys_view(),
            cache_values: self.cache.values_view(),
        };
        let outputs = self.engine.execute(inputs)?;
        outputs.validate(&inputs, self.engine.hyperparams().vocab_size())?;
        self.cache.update(&outputs.new_keys, &outputs.new_values)?;

        let id = self.sampler.sample(outputs.logits.row(0)?)?;
        self.metrics.steps += 1;
        if prefill {
            self.metrics.time_to_first_token = Some(self.started.elapsed());
            debug!(cached = self.cache.len(), first_token = id, "prefill complete");
        } else {
            self.metrics.token_times.push(step_started.elapsed());
            trace!(cached = self.cache.len(), token = id, "decode step");
        }

        if self.tokenizer.is_end_of_text(id) {
            self.finish(Some(FinishReason::EndOfText));
            return Ok(None);
        }

        self.tokens.push(id);
        self.metrics.generated_tokens += 1;
        let mut text = self.text.advance(self.tokenizer, &self.tokens)?;

        if self.cache.is_full() {
            text.push_str(&self.text.flush(self.tokenizer, &self.tokens)?);
            self.finish(Some(FinishReason::Length));
        } else {
            self.phase = Phase::Generate { last: id };
        }
        Ok(Some(GeneratedToken { id, text }))
    }

    /// Stops a run whose output nobody is reading. Timings are closed off;
    /// the finish reason stays `None`.
    pub fn abandon(&mut self) {
        if !self.is_done() {
            debug!(generated = self.metrics.generated_tokens, "generation abandoned");
            self.finish(None);
        }
    }

    fn finish(&mut self, reason: Option<FinishReason>) {
        self.phase = Phase::Done;
        self.finish_reason = reason;
        self.metrics.total = Some(self.started.elapsed());

        if let Some(reason) = reason {
            info!(
                ?reason,
                generated = self.metrics.generated_tokens,
                steps = self.metrics.steps,
                total_ms = millis(self.started.elapsed()),
                "generation finished"
            );
        }
    }
}

impl Iterator for Generation<'_> {
    type Item = Result<GeneratedToken, ServiceError>;

    fn next(&mut self) -> Option<Self::Item> {
        let input = match self.phase {
            Phase::Prefill => TokenBatch::broadcast(&self.tokens, self.batch_size),
            Phase::Generate { last } => TokenBatch::broadcast(&[last], self.batch_size),
            Phase::Done => return None,
        };

        let _entered = self.span.clone().entered();
        match self.step(&input) {
            Ok(token) => token.map(Ok),
            Err(err) => {
                error!(error = %err, step = self.metrics.steps, "generation aborted");
                self.finish(None);
                Some(Err(err))
            }
        }
    }
}

impl FusedIterator for Generation<'_> {}
