use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use super::capture::{CaptureOutcome, CaptureRequest, EvidenceCapture};
use super::config_store::ConfigWriteError;
use super::domain::EntityKind;
use super::repository::{
    AttributionRepository, ConfigRepository, EvaluationRepository, SessionDirectory,
};
use super::service::{AdminError, CheckoutPayload, EvaluationService, ResolutionUpdate};

/// Shared handler state: the evaluation service plus the evidence
/// recorder, both over the same repository set.
pub struct EngineState<A, S, E, C> {
    pub service: Arc<EvaluationService<A, S, E, C>>,
    pub capture: Arc<EvidenceCapture<A, C>>,
}

/// Router builder exposing the ingest and fraud-admin endpoints.
pub fn engine_router<A, S, E, C>(state: Arc<EngineState<A, S, E, C>>) -> Router
where
    A: AttributionRepository + 'static,
    S: SessionDirectory + 'static,
    E: EvaluationRepository + 'static,
    C: ConfigRepository + 'static,
{
    Router::new()
        .route("/api/v1/ingest/page-view", post(page_view_handler::<A, S, E, C>))
        .route(
            "/api/v1/ingest/checkout-completed",
            post(checkout_handler::<A, S, E, C>),
        )
        .route("/api/v1/fraud/markers", post(markers_handler::<A, S, E, C>))
        .route(
            "/api/v1/fraud/evaluations/:entity_kind/:entity_id",
            get(detail_handler::<A, S, E, C>),
        )
        .route(
            "/api/v1/fraud/config",
            get(read_config_handler::<A, S, E, C>).put(write_config_handler::<A, S, E, C>),
        )
        .route(
            "/api/v1/fraud/resolution",
            post(resolution_handler::<A, S, E, C>),
        )
        .with_state(state)
}

pub(crate) async fn page_view_handler<A, S, E, C>(
    State(state): State<Arc<EngineState<A, S, E, C>>>,
    axum::Json(request): axum::Json<CaptureRequest>,
) -> Response
where
    A: AttributionRepository + 'static,
    S: SessionDirectory + 'static,
    E: EvaluationRepository + 'static,
    C: ConfigRepository + 'static,
{
    let outcome = state.capture.capture(request, Utc::now());
    let label = match outcome {
        CaptureOutcome::Inserted => "inserted",
        CaptureOutcome::Updated => "updated",
        CaptureOutcome::RateLimited => "rate_limited",
        CaptureOutcome::Skipped => "skipped",
    };
    (StatusCode::ACCEPTED, axum::Json(json!({ "outcome": label }))).into_response()
}

#[derive(Debug, Deserialize)]
pub struct CheckoutCompletedBody {
    pub session_id: String,
    #[serde(flatten)]
    pub payload: CheckoutPayload,
}

pub(crate) async fn checkout_handler<A, S, E, C>(
    State(state): State<Arc<EngineState<A, S, E, C>>>,
    axum::Json(body): axum::Json<CheckoutCompletedBody>,
) -> Response
where
    A: AttributionRepository + 'static,
    S: SessionDirectory + 'static,
    E: EvaluationRepository + 'static,
    C: ConfigRepository + 'static,
{
    let outcome = state
        .service
        .evaluate_checkout_completed(&body.session_id, body.payload, Utc::now());
    (StatusCode::ACCEPTED, axum::Json(outcome)).into_response()
}

#[derive(Debug, Deserialize)]
pub struct MarkersBody {
    pub entity_kind: EntityKind,
    pub entity_ids: Vec<String>,
}

pub(crate) async fn markers_handler<A, S, E, C>(
    State(state): State<Arc<EngineState<A, S, E, C>>>,
    axum::Json(body): axum::Json<MarkersBody>,
) -> Response
where
    A: AttributionRepository + 'static,
    S: SessionDirectory + 'static,
    E: EvaluationRepository + 'static,
    C: ConfigRepository + 'static,
{
    let markers = state.service.markers(body.entity_kind, &body.entity_ids);
    (StatusCode::OK, axum::Json(json!({ "markers": markers }))).into_response()
}

pub(crate) async fn detail_handler<A, S, E, C>(
    State(state): State<Arc<EngineState<A, S, E, C>>>,
    Path((entity_kind, entity_id)): Path<(String, String)>,
) -> Response
where
    A: AttributionRepository + 'static,
    S: SessionDirectory + 'static,
    E: EvaluationRepository + 'static,
    C: ConfigRepository + 'static,
{
    let kind = match EntityKind::from_str(&entity_kind) {
        Ok(kind) => kind,
        Err(error) => {
            let payload = json!({ "error": error.to_string() });
            return (StatusCode::BAD_REQUEST, axum::Json(payload)).into_response();
        }
    };
    match state.service.detail(kind, &entity_id) {
        Ok(detail) => (StatusCode::OK, axum::Json(detail)).into_response(),
        Err(error) => admin_error_response(error),
    }
}

pub(crate) async fn read_config_handler<A, S, E, C>(
    State(state): State<Arc<EngineState<A, S, E, C>>>,
) -> Response
where
    A: AttributionRepository + 'static,
    S: SessionDirectory + 'static,
    E: EvaluationRepository + 'static,
    C: ConfigRepository + 'static,
{
    let config = state.service.read_config();
    (StatusCode::OK, axum::Json(config)).into_response()
}

pub(crate) async fn write_config_handler<A, S, E, C>(
    State(state): State<Arc<EngineState<A, S, E, C>>>,
    axum::Json(next): axum::Json<serde_json::Value>,
) -> Response
where
    A: AttributionRepository + 'static,
    S: SessionDirectory + 'static,
    E: EvaluationRepository + 'static,
    C: ConfigRepository + 'static,
{
    match state.service.write_config(next) {
        Ok(stored) => (StatusCode::OK, axum::Json(stored)).into_response(),
        Err(error) => admin_error_response(error),
    }
}

pub(crate) async fn resolution_handler<A, S, E, C>(
    State(state): State<Arc<EngineState<A, S, E, C>>>,
    axum::Json(update): axum::Json<ResolutionUpdate>,
) -> Response
where
    A: AttributionRepository + 'static,
    S: SessionDirectory + 'static,
    E: EvaluationRepository + 'static,
    C: ConfigRepository + 'static,
{
    match state.service.update_resolution(update, Utc::now()) {
        Ok(()) => (StatusCode::OK, axum::Json(json!({ "updated": true }))).into_response(),
        Err(error) => admin_error_response(error),
    }
}

fn admin_error_response(error: AdminError) -> Response {
    let status = match &error {
        AdminError::NotFound => StatusCode::NOT_FOUND,
        AdminError::InvalidStatus(_)
        | AdminError::NoteTooLong
        | AdminError::MissingIdentifier => StatusCode::UNPROCESSABLE_ENTITY,
        AdminError::Config(ConfigWriteError::Rejected(_)) => StatusCode::UNPROCESSABLE_ENTITY,
        AdminError::Storage(_) | AdminError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let payload = json!({ "error": error.to_string() });
    (status, axum::Json(payload)).into_response()
}
