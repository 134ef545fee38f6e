use std::{convert::Infallible, sync::Arc};

use axum::{
    Json, Router,
    extract::State,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt, stream};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    config::AppConfig,
    error::ServiceError,
    evaluation::{EvaluationReport, fallback_samples, load_samples_from_path, run_benchmark},
    model::{ChatCompletionChunk, ChatRequest},
    service::{InferenceService, ServiceMetadata},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub service: Arc<InferenceService>,
    pub evaluation: Arc<RwLock<Option<EvaluationReport>>>,
}

#[derive(Serialize)]
struct MetadataResponse {
    #[serde(flatten)]
    service: ServiceMetadata,
    evaluation: Option<EvaluationReport>,
}

pub fn build_router(config: Arc<AppConfig>, service: Arc<InferenceService>) -> Router {
    let state = AppState {
        evaluation: Arc::new(RwLock::new(None)),
        service,
        config,
    };

    Router::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/metadata", get(metadata))
        .route("/evaluate", post(run_evaluation))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn health() -> &'static str {
    "ok"
}

async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ServiceError> {
    let prepared = state.service.prepare(&request)?;

    if prepared.stream {
        let handle = state.service.clone().spawn_stream(prepared).await?;
        return Ok(Sse::new(sse_events(handle.chunks))
            .keep_alive(KeepAlive::default())
            .into_response());
    }

    let completion = state.service.clone().complete_async(prepared).await?;
    Ok(Json(completion).into_response())
}

/// One `data:` event per chunk; the stream ends when the run does. Dropping
/// the response drops the receiver, which stops generation.
fn sse_events(
    chunks: mpsc::Receiver<ChatCompletionChunk>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(chunks, |mut chunks| async move {
        let chunk = chunks.recv().await?;
        Some((chunk, chunks))
    })
    .filter_map(|chunk| async move {
        match Event::default().json_data(&chunk) {
            Ok(event) => Some(Ok(event)),
            Err(err) => {
                warn!(error = %err, "dropping unserializable chunk");
                None
            }
        }
    })
}

async fn metadata(State(state): State<AppState>) -> Json<MetadataResponse> {
    Json(MetadataResponse {
        service: state.service.metadata(),
        evaluation: state.evaluation.read().clone(),
    })
}

async fn run_evaluation(
    State(state): State<AppState>,
) -> Result<Json<EvaluationReport>, ServiceError> {
    let samples = if let Some(path) = state.config.eval_prompts_path.as_ref() {
        load_samples_from_path(path)?
    } else {
        fallback_samples()
    };

    info!(count = samples.len(), "running evaluation benchmark");

    let report = run_benchmark(state.service.clone(), samples).await?;
    state.evaluation.write().replace(report.clone());

    Ok(Json(report))
}
