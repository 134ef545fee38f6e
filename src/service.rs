//! Bridges chat-style requests to decode-loop runs.
//!
//! Each request gets its own [`Generation`] (and with it its own cache and
//! sampler); the engine and tokenizer are shared read-only.

use std::{io::Write, sync::Arc, time::Duration};

use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task,
};
use tracing::{debug, info, warn};

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{
        ChatChoice, ChatCompletion, ChatCompletionChunk, ChatMessage, ChatRequest,
        ExecutionEngine, FinishReason, Generation, GenerationConfig, MetricsReport, ModelMetadata,
        SamplerParams, Tokenizer, Usage,
    },
    quantization::QuantizationSummary,
};

/// The output side of a stream went away.
#[derive(Debug, Error)]
#[error("stream write failed: {0}")]
pub struct StreamWriteError(pub String);

/// Destination for streamed chunks.
pub trait ChunkSink {
    fn send(&mut self, chunk: ChatCompletionChunk) -> Result<(), StreamWriteError>;
}

/// Must be driven from a blocking thread.
impl ChunkSink for mpsc::Sender<ChatCompletionChunk> {
    fn send(&mut self, chunk: ChatCompletionChunk) -> Result<(), StreamWriteError> {
        self.blocking_send(chunk)
            .map_err(|_| StreamWriteError("receiver dropped".into()))
    }
}

/// Writes each chunk's text straight to `W`.
pub struct WriterSink<W: Write>(pub W);

impl<W: Write> ChunkSink for WriterSink<W> {
    fn send(&mut self, chunk: ChatCompletionChunk) -> Result<(), StreamWriteError> {
        for choice in &chunk.choices {
            self.0
                .write_all(choice.delta.content.as_bytes())
                .map_err(|e| StreamWriteError(e.to_string()))?;
        }
        self.0.flush().map_err(|e| StreamWriteError(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct GenerationDefaults {
    pub max_new_tokens: usize,
    pub batch_size: usize,
    pub sampler: SamplerParams,
    pub seed: Option<u64>,
    pub prompt_prefix: Option<String>,
}

impl GenerationDefaults {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_new_tokens: config.max_new_tokens,
            batch_size: config.batch_size,
            sampler: config.sampler_params(),
            seed: config.seed,
            prompt_prefix: config.prompt_prefix.clone(),
        }
    }
}

/// A request that passed validation and tokenization.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub prompt_ids: Vec<u32>,
    pub config: GenerationConfig,
    pub stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamOutcome {
    Completed(FinishReason),
    ClientDisconnected,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamSummary {
    pub chunks_delivered: usize,
    pub token_ids: Vec<u32>,
    pub outcome: StreamOutcome,
    pub metrics: MetricsReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceMetadata {
    pub model: ModelMetadata,
    pub quantization: QuantizationSummary,
    pub startup_ms: f64,
}

pub struct InferenceService {
    engine: Arc<dyn ExecutionEngine>,
    tokenizer: Arc<dyn Tokenizer>,
    defaults: GenerationDefaults,
    startup: Duration,
}

impl InferenceService {
    pub fn new(
        engine: Arc<dyn ExecutionEngine>,
        tokenizer: Arc<dyn Tokenizer>,
        defaults: GenerationDefaults,
    ) -> Self {
        Self {
            engine,
            tokenizer,
            defaults,
            startup: Duration::ZERO,
        }
    }

    /// Records how long model loading took, for reporting.
    pub fn with_startup(mut self, startup: Duration) -> Self {
        self.startup = startup;
        self
    }

    pub fn metadata(&self) -> ServiceMetadata {
        ServiceMetadata {
            model: ModelMetadata::describe(self.engine.as_ref()),
            quantization: QuantizationSummary::estimate(
                self.engine.hyperparams(),
                self.engine.encoding(),
            ),
            startup_ms: self.startup.as_secs_f64() * 1_000.0,
        }
    }

    /// Validates parameters and tokenizes the prompt. Nothing executes yet.
    pub fn prepare(&self, request: &ChatRequest) -> Result<PreparedRequest, ServiceError> {
        if request.messages.is_empty() {
            return Err(ServiceError::BadRequest("messages must not be empty".into()));
        }
        self.prepare_text(&request.prompt(), request)
    }

    /// Like [`prepare`](Self::prepare) but encodes `text` as-is, with the
    /// configured defaults for everything else.
    pub fn prepare_prompt(&self, text: &str, stream: bool) -> Result<PreparedRequest, ServiceError> {
        let mut overrides = ChatRequest::new(Vec::new());
        overrides.stream = stream;
        self.prepare_text(text, &overrides)
    }

    fn prepare_text(
        &self,
        text: &str,
        overrides: &ChatRequest,
    ) -> Result<PreparedRequest, ServiceError> {
        let max_new_tokens = overrides
            .max_new_tokens
            .unwrap_or(self.defaults.max_new_tokens);
        if max_new_tokens == 0 {
            return Err(ServiceError::Configuration("max_new_tokens must be at least 1".into()));
        }
        if max_new_tokens > self.defaults.max_new_tokens {
            return Err(ServiceError::Configuration(format!(
                "max_new_tokens {max_new_tokens} exceeds the server limit of {}",
                self.defaults.max_new_tokens
            )));
        }
        let sampler = SamplerParams {
            temperature: overrides
                .temperature
                .unwrap_or(self.defaults.sampler.temperature),
            min_p: overrides.min_p.unwrap_or(self.defaults.sampler.min_p),
        };
        sampler.validate()?;
        let seed = overrides
            .seed
            .or(self.defaults.seed)
            .unwrap_or_else(rand::random);

        let prompt_ids = self
            .tokenizer
            .encode(text, self.defaults.prompt_prefix.as_deref())?;

        // The final sampled token is never fed back, so N new tokens need
        // prompt + N - 1 cache positions.
        let max_tokens = prompt_ids
            .len()
            .checked_add(max_new_tokens - 1)
            .ok_or_else(|| ServiceError::Configuration("max_new_tokens is too large".into()))?;

        Ok(PreparedRequest {
            prompt_ids,
            config: GenerationConfig {
                max_tokens,
                batch_size: self.defaults.batch_size,
                sampler,
                seed,
            },
            stream: overrides.stream,
        })
    }

    /// Runs to completion and assembles one assistant message.
    pub fn complete(&self, prepared: PreparedRequest) -> Result<ChatCompletion, ServiceError> {
        let mut generation = self.begin(prepared)?;

        let mut content = String::new();
        for token in generation.by_ref() {
            content.push_str(&token?.text);
        }

        let prompt_tokens = generation.prompt_len();
        let completion_tokens = generation.generated().len();
        Ok(ChatCompletion {
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage::new("assistant", content),
                finish_reason: generation.finish_reason(),
            }],
            usage: Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            },
            metrics: Some(generation.metrics().report()),
        })
    }

    /// Allocates the run's cache and sampler. Nothing executes yet.
    fn begin(&self, prepared: PreparedRequest) -> Result<Generation<'_>, ServiceError> {
        Generation::new(
            self.engine.as_ref(),
            self.tokenizer.as_ref(),
            prepared.prompt_ids,
            prepared.config,
        )
    }

    /// Emits one chunk per text fragment as soon as its token is sampled.
    ///
    /// A failed write ends the run quietly. Only failures before generation
    /// starts are returned as errors; anything later truncates the stream.
    pub fn stream<S: ChunkSink>(
        &self,
        prepared: PreparedRequest,
        sink: &mut S,
    ) -> Result<StreamSummary, ServiceError> {
        let generation = self.begin(prepared)?;
        Ok(drive_stream(generation, sink))
    }

    /// Non-streaming request on a blocking worker thread.
    pub async fn complete_async(
        self: Arc<Self>,
        prepared: PreparedRequest,
    ) -> Result<ChatCompletion, ServiceError> {
        task::spawn_blocking(move || self.complete(prepared))
            .await
            .map_err(|err| ServiceError::Execution(format!("inference task failed: {err}")))?
    }

    /// Starts a streaming run on a blocking worker thread.
    ///
    /// Resolves once the run's cache is allocated, so a run that cannot start
    /// fails here rather than as an empty stream.
    pub async fn spawn_stream(
        self: Arc<Self>,
        prepared: PreparedRequest,
    ) -> Result<StreamHandle, ServiceError> {
        let (mut tx, chunks) = mpsc::channel(STREAM_BUFFER);
        let (started_tx, started_rx) = oneshot::channel();

        let summary = task::spawn_blocking(move || {
            let generation = match self.begin(prepared) {
                Ok(generation) => generation,
                Err(err) => {
                    let _ = started_tx.send(Err(err));
                    return None;
                }
            };
            let _ = started_tx.send(Ok(()));

            let summary = drive_stream(generation, &mut tx);
            info!(
                chunks = summary.chunks_delivered,
                outcome = ?summary.outcome,
                "stream finished"
            );
            Some(summary)
        });

        match started_rx.await {
            Ok(Ok(())) => Ok(StreamHandle { chunks, summary }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ServiceError::Execution("stream task ended before starting".into())),
        }
    }
}

/// Chunks buffered between the decode thread and the transport.
const STREAM_BUFFER: usize = 32;

/// A started streaming run.
pub struct StreamHandle {
    /// Closes when the run ends. Dropping it stops generation at the next write.
    pub chunks: mpsc::Receiver<ChatCompletionChunk>,
    /// `None` only for a run that never started, which `spawn_stream` has
    /// already reported as an error.
    pub summary: task::JoinHandle<Option<StreamSummary>>,
}

fn drive_stream<S: ChunkSink>(mut generation: Generation<'_>, sink: &mut S) -> StreamSummary {
    let mut chunks_delivered = 0;
    let mut outcome = None;
    while let Some(token) = generation.next() {
        let token = match token {
            Ok(token) => token,
            Err(err) => {
                warn!(error = %err, chunks_delivered, "stream truncated by generation failure");
                outcome = Some(StreamOutcome::Failed);
                break;
            }
        };
        // A token that ends mid-character carries no text yet.
        if token.text.is_empty() {
            continue;
        }
        if let Err(err) = sink.send(ChatCompletionChunk::content(token.text)) {
            debug!(error = %err, chunks_delivered, "client went away; stopping generation");
            generation.abandon();
            outcome = Some(StreamOutcome::ClientDisconnected);
            break;
        }
        chunks_delivered += 1;
    }

    let outcome = match (outcome, generation.finish_reason()) {
        (Some(outcome), _) => outcome,
        (None, Some(reason)) => StreamOutcome::Completed(reason),
        (None, None) => StreamOutcome::Failed,
    };
    StreamSummary {
        chunks_delivered,
        token_ids: generation.generated().to_vec(),
        outcome,
        metrics: generation.metrics().report(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testing::{EOT, ScriptedEngine, ScriptedTokenizer};

    /// What `ScriptedTokenizer` makes of `user:Hello`.
    const USER_HELLO: u32 = 110;

    fn defaults() -> GenerationDefaults {
        GenerationDefaults {
            max_new_tokens: 16,
            batch_size: 1,
            sampler: SamplerParams {
                temperature: 0.8,
                min_p: 0.05,
            },
            seed: Some(17),
            prompt_prefix: None,
        }
    }

    fn service(engine: ScriptedEngine) -> InferenceService {
        InferenceService::new(Arc::new(engine), Arc::new(ScriptedTokenizer), defaults())
    }

    fn hello() -> ChatRequest {
        ChatRequest::new(vec![ChatMessage::new("user", "Hello")])
    }

    /// Collects chunks and fails on the `fail_at`-th send (zero-based).
    struct RecordingSink {
        chunks: Vec<ChatCompletionChunk>,
        fail_at: Option<usize>,
        attempts: usize,
    }

    impl RecordingSink {
        fn new(fail_at: Option<usize>) -> Self {
            Self {
                chunks: Vec::new(),
                fail_at,
                attempts: 0,
            }
        }
    }

    impl ChunkSink for RecordingSink {
        fn send(&mut self, chunk: ChatCompletionChunk) -> Result<(), StreamWriteError> {
            let attempt = self.attempts;
            self.attempts += 1;
            if self.fail_at == Some(attempt) {
                return Err(StreamWriteError("broken pipe".into()));
            }
            self.chunks.push(chunk);
            Ok(())
        }
    }

    #[test]
    fn prepare_sizes_cache_for_requested_new_tokens() {
        let svc = service(ScriptedEngine::new());
        let mut request = hello();
        request.max_new_tokens = Some(3);
        let prepared = svc.prepare(&request).unwrap();
        assert_eq!(prepared.prompt_ids, vec![1, USER_HELLO]);
        assert_eq!(prepared.config.max_tokens, 4);
        assert_eq!(prepared.config.seed, 17);
        assert!(!prepared.stream);
    }

    #[test]
    fn raw_prompts_skip_chat_formatting() {
        let svc = service(ScriptedEngine::new());
        let prepared = svc.prepare_prompt("Hello", true).unwrap();
        assert_eq!(prepared.prompt_ids, vec![1, crate::model::testing::HELLO]);
        assert_eq!(prepared.config.max_tokens, 17);
        assert!(prepared.stream);
    }

    #[test]
    fn prepare_rejects_bad_requests_before_running() {
        let svc = service(ScriptedEngine::new());
        assert!(matches!(
            svc.prepare(&ChatRequest::new(vec![])),
            Err(ServiceError::BadRequest(_))
        ));

        let mut request = hello();
        request.temperature = Some(0.0);
        assert!(matches!(
            svc.prepare(&request),
            Err(ServiceError::Configuration(_))
        ));

        let mut request = hello();
        request.max_new_tokens = Some(0);
        assert!(matches!(
            svc.prepare(&request),
            Err(ServiceError::Configuration(_))
        ));
    }

    #[test]
    fn requests_cannot_raise_the_token_limit() {
        let svc = service(ScriptedEngine::new());
        let mut request = hello();
        request.max_new_tokens = Some(16);
        assert!(svc.prepare(&request).is_ok());

        request.max_new_tokens = Some(50_000_000);
        assert!(matches!(
            svc.prepare(&request),
            Err(ServiceError::Configuration(_))
        ));
    }

    #[test]
    fn complete_emits_exactly_max_new_tokens() {
        let svc = service(ScriptedEngine::new());
        let mut request = hello();
        request.min_p = Some(1.0);
        request.max_new_tokens = Some(4);
        let completion = svc.complete(svc.prepare(&request).unwrap()).unwrap();

        let choice = &completion.choices[0];
        assert_eq!(choice.index, 0);
        assert_eq!(choice.message.role, "assistant");
        assert_eq!(choice.finish_reason, Some(FinishReason::Length));
        assert_eq!(completion.usage.completion_tokens, 4);
        assert_eq!(completion.usage.total_tokens, 6);
        assert!(completion.metrics.is_some());
    }

    #[test]
    fn streaming_and_batch_agree_for_a_fixed_seed() {
        let svc = service(ScriptedEngine::new());
        let mut request = hello();
        request.max_new_tokens = Some(12);

        let completion = svc.complete(svc.prepare(&request).unwrap()).unwrap();

        let mut sink = RecordingSink::new(None);
        let summary = svc.stream(svc.prepare(&request).unwrap(), &mut sink).unwrap();

        let streamed: String = sink
            .chunks
            .iter()
            .map(|c| c.choices[0].delta.content.as_str())
            .collect();
        assert_eq!(streamed, completion.choices[0].message.content);
        assert_eq!(summary.chunks_delivered, 12);
        assert_eq!(summary.token_ids.len(), completion.usage.completion_tokens);
        assert_eq!(summary.outcome, StreamOutcome::Completed(FinishReason::Length));
    }

    #[test]
    fn broken_writer_on_second_chunk_stops_quietly() {
        let engine = Arc::new(ScriptedEngine::new());
        let svc = InferenceService::new(engine.clone(), Arc::new(ScriptedTokenizer), defaults());
        let mut request = hello();
        request.max_new_tokens = Some(10);

        let mut sink = RecordingSink::new(Some(1));
        let summary = svc.stream(svc.prepare(&request).unwrap(), &mut sink).unwrap();

        assert_eq!(sink.chunks.len(), 1);
        assert_eq!(summary.chunks_delivered, 1);
        assert_eq!(summary.outcome, StreamOutcome::ClientDisconnected);
        // Prefill plus the step that produced the undeliverable chunk.
        assert_eq!(engine.calls().len(), 2);
    }

    #[test]
    fn end_of_text_closes_the_stream() {
        let engine = ScriptedEngine::new()
            .with_transition(USER_HELLO, 50)
            .with_transition(50, EOT);
        let svc = service(engine);
        let mut request = hello();
        request.min_p = Some(1.0);

        let mut sink = RecordingSink::new(None);
        let summary = svc.stream(svc.prepare(&request).unwrap(), &mut sink).unwrap();
        assert_eq!(sink.chunks, vec![ChatCompletionChunk::content(" t50")]);
        assert_eq!(summary.outcome, StreamOutcome::Completed(FinishReason::EndOfText));
    }

    #[test]
    fn execution_failure_fails_batch_but_truncates_stream() {
        let svc = service(ScriptedEngine::new().failing_on_call(2));
        let request = hello();

        assert!(matches!(
            svc.complete(svc.prepare(&request).unwrap()),
            Err(ServiceError::Execution(_))
        ));

        let svc = service(ScriptedEngine::new().failing_on_call(2));
        let mut sink = RecordingSink::new(None);
        let summary = svc.stream(svc.prepare(&request).unwrap(), &mut sink).unwrap();
        assert_eq!(sink.chunks.len(), 2);
        assert_eq!(summary.outcome, StreamOutcome::Failed);
    }

    #[test]
    fn writer_sink_writes_fragments() {
        let mut sink = WriterSink(Vec::new());
        sink.send(ChatCompletionChunk::content("Hel")).unwrap();
        sink.send(ChatCompletionChunk::content("lo")).unwrap();
        assert_eq!(sink.0, b"Hello");
    }

    #[test]
    fn metadata_reports_model_and_encoding() {
        let svc = service(ScriptedEngine::new()).with_startup(Duration::from_millis(1500));
        let metadata = svc.metadata();
        assert_eq!(metadata.model.name, "scripted");
        assert_eq!(metadata.quantization.encoding, "float32");
        assert_eq!(metadata.startup_ms, 1500.0);
    }

    #[tokio::test]
    async fn spawned_stream_reports_allocation_failure_up_front() {
        let engine = Arc::new(ScriptedEngine::new());
        let svc = Arc::new(InferenceService::new(
            engine.clone(),
            Arc::new(ScriptedTokenizer),
            GenerationDefaults {
                max_new_tokens: usize::MAX / 2,
                ..defaults()
            },
        ));
        let prepared = svc.prepare(&hello()).unwrap();

        match svc.clone().spawn_stream(prepared).await {
            Err(ServiceError::Allocation(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("stream started without a cache"),
        }
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn dropping_the_receiver_stops_a_spawned_stream() {
        let engine = Arc::new(ScriptedEngine::new());
        let svc = Arc::new(InferenceService::new(
            engine.clone(),
            Arc::new(ScriptedTokenizer),
            GenerationDefaults {
                max_new_tokens: 1_000,
                ..defaults()
            },
        ));
        let prepared = svc.prepare(&hello()).unwrap();

        let StreamHandle {
            mut chunks,
            summary,
        } = svc.clone().spawn_stream(prepared).await.unwrap();
        assert!(chunks.recv().await.is_some());
        drop(chunks);

        let summary = summary.await.unwrap().unwrap();
        assert_eq!(summary.outcome, StreamOutcome::ClientDisconnected);
        assert!(summary.chunks_delivered <= STREAM_BUFFER + 1);
        // One engine call per delivered chunk plus the one that could not be sent.
        assert_eq!(engine.calls().len(), summary.chunks_delivered + 1);
        assert!(summary.metrics.total_ms > 0.0);
    }
}
