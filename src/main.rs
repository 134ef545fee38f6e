//! Text-generation server binary.
//!
//! Model execution needs the TorchScript backend:
//! `cargo run --features tch-backend`. A build without it still starts, but
//! exits at model load with a configuration error naming the missing feature.

use std::{io, sync::Arc};

use tokio::{net::TcpListener, task};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use textgen_service::{
    AppConfig, GenerationDefaults, InferenceService, ModelArtifacts, build_router,
    service::WriterSink,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::from_env());
    config.validate()?;
    tracing::info!(
        model = %config.model_path.display(),
        encoding = %config.quantization_encoding,
        "loading model artifacts"
    );

    let artifacts = {
        let config = config.clone();
        task::spawn_blocking(move || ModelArtifacts::load(&config)).await??
    };
    tracing::info!(load_ms = artifacts.load_time.as_millis() as u64, "model ready");

    let service = Arc::new(
        InferenceService::new(
            artifacts.engine,
            artifacts.tokenizer,
            GenerationDefaults::from_config(&config),
        )
        .with_startup(artifacts.load_time),
    );

    if let Some(prompt) = config.prompt.as_deref() {
        return run_prompt(service, prompt).await;
    }

    let router = build_router(config.clone(), service);

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "REST server ready");

    axum::serve(listener, router).await?;

    Ok(())
}

/// One-shot mode: stream a single completion to stdout, then report timings.
async fn run_prompt(service: Arc<InferenceService>, prompt: &str) -> anyhow::Result<()> {
    let prepared = service.prepare_prompt(prompt, true)?;
    print!("{prompt}");

    let summary = task::spawn_blocking(move || {
        let mut sink = WriterSink(io::stdout().lock());
        service.stream(prepared, &mut sink)
    })
    .await??;
    println!();

    let metrics = &summary.metrics;
    tracing::info!(
        outcome = ?summary.outcome,
        startup_ms = metrics.startup_ms,
        prompt_tokens = metrics.prompt_tokens,
        time_to_first_token_ms = ?metrics.time_to_first_token_ms,
        generated_tokens = metrics.generated_tokens,
        mean_token_ms = ?metrics.mean_token_ms,
        tokens_per_second = metrics.tokens_per_second,
        total_ms = metrics.total_ms,
        "generation metrics"
    );
    Ok(())
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(io::stderr)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
