//! Runs a fixed prompt set through the completion path and aggregates timing.

use std::{fs, path::Path, sync::Arc};

use serde::Serialize;
use tracing::{debug, info};

use crate::{
    error::ServiceError,
    model::{ChatMessage, ChatRequest, FinishReason, MetricsReport, Usage},
    service::InferenceService,
};

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkSample {
    pub prompt: String,
    pub reference_substring: Option<String>,
    pub max_new_tokens: Option<usize>,
}

impl BenchmarkSample {
    fn new(prompt: &str, reference: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            reference_substring: Some(reference.to_string()),
            max_new_tokens: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleReport {
    pub prompt: String,
    pub completion: String,
    pub finish_reason: Option<FinishReason>,
    pub usage: Usage,
    pub metrics: Option<MetricsReport>,
    pub reference_match: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateMetrics {
    pub avg_latency_ms: f64,
    pub avg_tokens_per_s: f64,
    pub avg_time_to_first_token_ms: Option<f64>,
    pub total_generated_tokens: usize,
    pub reference_match_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub samples: Vec<SampleReport>,
    pub aggregate: AggregateMetrics,
}

pub async fn run_benchmark(
    service: Arc<InferenceService>,
    samples: Vec<BenchmarkSample>,
) -> Result<EvaluationReport, ServiceError> {
    if samples.is_empty() {
        return Err(ServiceError::BadRequest(
            "at least one benchmark sample is required".into(),
        ));
    }

    let mut reports = Vec::with_capacity(samples.len());
    for sample in samples {
        let mut request = ChatRequest::new(vec![ChatMessage::new("user", sample.prompt.clone())]);
        request.max_new_tokens = sample.max_new_tokens;

        let prepared = service.prepare(&request)?;
        let completion = service.clone().complete_async(prepared).await?;
        let Some(choice) = completion.choices.into_iter().next() else {
            return Err(ServiceError::Execution("completion has no choices".into()));
        };

        let reference_match = sample.reference_substring.as_ref().map(|needle| {
            choice
                .message
                .content
                .to_lowercase()
                .contains(&needle.to_lowercase())
        });
        debug!(
            prompt = %sample.prompt,
            tokens = completion.usage.completion_tokens,
            ?reference_match,
            "benchmark sample done"
        );

        reports.push(SampleReport {
            prompt: sample.prompt,
            completion: choice.message.content,
            finish_reason: choice.finish_reason,
            usage: completion.usage,
            metrics: completion.metrics,
            reference_match,
        });
    }

    let aggregate = summarize(&reports);
    info!(
        samples = reports.len(),
        avg_latency_ms = aggregate.avg_latency_ms,
        avg_tokens_per_s = aggregate.avg_tokens_per_s,
        "benchmark complete"
    );

    Ok(EvaluationReport {
        samples: reports,
        aggregate,
    })
}

/// Reads `[{"prompt": ..., "reference_substring": ..., "max_new_tokens": ...}]`.
pub fn load_samples_from_path(path: &Path) -> Result<Vec<BenchmarkSample>, ServiceError> {
    let raw = fs::read_to_string(path)?;
    parse_samples(&raw)
}

fn parse_samples(raw: &str) -> Result<Vec<BenchmarkSample>, ServiceError> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| ServiceError::BadRequest(format!("invalid benchmark file: {e}")))?;

    let serde_json::Value::Array(items) = value else {
        return Err(ServiceError::BadRequest(
            "benchmark file must be a JSON array".into(),
        ));
    };

    items
        .into_iter()
        .enumerate()
        .map(|(idx, item)| {
            let prompt = item.get("prompt").and_then(|v| v.as_str()).ok_or_else(|| {
                ServiceError::BadRequest(format!(
                    "benchmark item {idx} missing string field 'prompt'"
                ))
            })?;
            Ok(BenchmarkSample {
                prompt: prompt.to_string(),
                reference_substring: item
                    .get("reference_substring")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                max_new_tokens: item
                    .get("max_new_tokens")
                    .and_then(|v| v.as_u64())
                    .map(|n| n as usize),
            })
        })
        .collect()
}

pub fn fallback_samples() -> Vec<BenchmarkSample> {
    vec![
        BenchmarkSample::new("I believe the meaning of life is", "life"),
        BenchmarkSample::new(
            "Explain why a key/value cache speeds up autoregressive decoding.",
            "cache",
        ),
        BenchmarkSample::new("Summarize the rust borrow checker in one sentence.", "borrow"),
    ]
}

fn summarize(reports: &[SampleReport]) -> AggregateMetrics {
    let metrics = || reports.iter().filter_map(|r| r.metrics.as_ref());

    AggregateMetrics {
        avg_latency_ms: mean(metrics().map(|m| m.total_ms)).unwrap_or(0.0),
        avg_tokens_per_s: mean(metrics().map(|m| m.tokens_per_second)).unwrap_or(0.0),
        avg_time_to_first_token_ms: mean(metrics().filter_map(|m| m.time_to_first_token_ms)),
        total_generated_tokens: reports.iter().map(|r| r.usage.completion_tokens).sum(),
        reference_match_rate: mean(
            reports
                .iter()
                .filter_map(|r| r.reference_match)
                .map(|hit| if hit { 1.0 } else { 0.0 }),
        ),
    }
}

fn mean<I>(values: I) -> Option<f64>
where
    I: IntoIterator<Item = f64>,
{
    let mut count = 0usize;
    let mut acc = 0.0;
    for value in values {
        count += 1;
        acc += value;
    }
    (count > 0).then(|| acc / count as f64)
}
