use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use axum_prometheus::PrometheusMetricLayer;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tracing::info;

use clickguard::config::AppConfig;
use clickguard::engine::{
    engine_router, BackfillJob, BackfillSettings, ConfigStore, EngineState, EvaluationService,
    EvidenceCapture, InMemoryAttributionRepository, InMemoryConfigRepository,
    InMemoryEvaluationRepository, InMemorySessionDirectory,
};
use clickguard::error::AppError;
use clickguard::telemetry;

#[derive(Parser, Debug)]
#[command(
    name = "clickguard",
    about = "Affiliate-fraud attribution and scoring service",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service (default command)
    Serve(ServeArgs),
    /// Run the historical-evaluation backfill once and print its report
    Backfill(BackfillArgs),
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Args, Debug)]
struct BackfillArgs {
    /// How far back to scan for unevaluated checkouts
    #[arg(long, default_value_t = 30)]
    lookback_days: u32,
    /// Records evaluated between cooperative pauses
    #[arg(long, default_value_t = 100)]
    chunk_size: usize,
    /// Ceiling on records handled in one invocation
    #[arg(long, default_value_t = 1000)]
    max_records: usize,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("application error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => serve(args).await,
        Command::Backfill(args) => backfill(args).await,
    }
}

struct Engine {
    state: Arc<
        EngineState<
            InMemoryAttributionRepository,
            InMemorySessionDirectory,
            InMemoryEvaluationRepository,
            InMemoryConfigRepository,
        >,
    >,
    directory: Arc<InMemorySessionDirectory>,
    evaluations: Arc<InMemoryEvaluationRepository>,
    config_repository: Arc<InMemoryConfigRepository>,
}

fn build_engine(hash_salt: String) -> Engine {
    let attribution = Arc::new(InMemoryAttributionRepository::default());
    let directory = Arc::new(InMemorySessionDirectory::default());
    let evaluations = Arc::new(InMemoryEvaluationRepository::default());
    let config_repository = Arc::new(InMemoryConfigRepository::default());
    let config_store = Arc::new(ConfigStore::new(config_repository.clone()));

    let service = Arc::new(EvaluationService::new(
        attribution.clone(),
        directory.clone(),
        evaluations.clone(),
        config_store.clone(),
        None,
    ));
    let capture = Arc::new(EvidenceCapture::new(attribution, config_store, hash_salt));

    Engine {
        state: Arc::new(EngineState { service, capture }),
        directory,
        evaluations,
        config_repository,
    }
}

async fn serve(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let engine = build_engine(config.privacy.hash_salt.clone());
    let app = engine_router(engine.state)
        .route("/health", axum::routing::get(healthcheck))
        .route("/ready", axum::routing::get(readiness_endpoint))
        .route("/metrics", axum::routing::get(metrics_endpoint))
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(?config.environment, %addr, "fraud attribution service ready");

    axum::serve(listener, app).await?;
    Ok(())
}

async fn backfill(args: BackfillArgs) -> Result<(), AppError> {
    let config = AppConfig::load()?;
    telemetry::init(&config.telemetry)?;

    let engine = build_engine(config.privacy.hash_salt.clone());
    let settings = BackfillSettings {
        lookback_days: args.lookback_days,
        chunk_size: args.chunk_size,
        max_records_per_run: args.max_records,
        pause_between_chunks: Duration::from_millis(50),
    };
    let job = BackfillJob::new(
        engine.directory,
        engine.evaluations,
        engine.config_repository,
        engine.state.service.clone(),
        settings,
    );

    let report = job.run(Utc::now()).await;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).expect("report serializes")
    );
    Ok(())
}

#[derive(Clone)]
struct AppState {
    readiness: Arc<AtomicBool>,
    metrics: Arc<PrometheusHandle>,
}

async fn healthcheck() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn readiness_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let ready = state.readiness.load(Ordering::Relaxed);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let payload = if ready {
        json!({ "status": "ready" })
    } else {
        json!({ "status": "initializing" })
    };

    (status, Json(payload))
}

async fn metrics_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
