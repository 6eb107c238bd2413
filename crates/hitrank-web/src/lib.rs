//! Axum JSON API over the hitrank engine.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hitrank_adapters::UpstreamProvider;
use hitrank_core::{DescriptionRequest, Record, RecordPatch};
use hitrank_sync::{AppConfig, Engine, EngineError, RankUpdate, ReconcileSummary};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub const CRATE_NAME: &str = "hitrank-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub upstream: Arc<dyn UpstreamProvider>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, upstream: Arc<dyn UpstreamProvider>) -> Self {
        Self { engine, upstream }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("invalid request body: {}", .0.body_text())]
    Body(#[from] JsonRejection),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Body(_) => (StatusCode::BAD_REQUEST, "INVALID_BODY"),
            ApiError::Engine(err) => match err {
                EngineError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                EngineError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
                EngineError::UpstreamFetch(_) => (StatusCode::BAD_GATEWAY, "UPSTREAM_FETCH_ERROR"),
                EngineError::Generation(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "GENERATION_FAILURE")
                }
                EngineError::Read(_) => (StatusCode::INTERNAL_SERVER_ERROR, "READ_ERROR"),
                EngineError::Write(_) => (StatusCode::INTERNAL_SERVER_ERROR, "WRITE_ERROR"),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            error!(code, error = %self, "request failed");
        }

        let body = Json(json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Serialize)]
struct DescriptionResponse {
    description: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/records", get(list_records_handler))
        .route("/record/{id}", get(get_record_handler).put(edit_record_handler))
        .route("/reconcile", post(reconcile_handler))
        .route("/recalculate/{year}", post(recalculate_handler))
        .route("/generate-description", post(generate_description_handler))
        // paths used by the original frontend
        .route("/players", get(list_records_handler))
        .route("/player/{id}", get(get_record_handler).put(edit_record_handler))
        .route("/fetch-and-correct-data", get(reconcile_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

pub async fn serve(port: u16, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = AppConfig::from_env();
    let engine = hitrank_sync::build_engine(&config).await?;
    let upstream = hitrank_sync::build_upstream(&config)?;
    serve(config.web_port, AppState::new(Arc::new(engine), upstream)).await
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn list_records_handler(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Record>> {
    Ok(Json(state.engine.list_records().await?))
}

async fn get_record_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Record> {
    Ok(Json(state.engine.get_record(id).await?))
}

async fn edit_record_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    body: Result<Json<RecordPatch>, JsonRejection>,
) -> ApiResult<Record> {
    let Json(patch) = body?;
    Ok(Json(state.engine.edit_record(id, &patch).await?))
}

async fn reconcile_handler(State(state): State<Arc<AppState>>) -> ApiResult<ReconcileSummary> {
    Ok(Json(state.engine.reconcile_from(state.upstream.as_ref()).await?))
}

async fn recalculate_handler(
    State(state): State<Arc<AppState>>,
    Path(year): Path<i32>,
) -> ApiResult<RankUpdate> {
    Ok(Json(state.engine.recalculate_ranks(year).await?))
}

async fn generate_description_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<DescriptionRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = body?;
    let description = state.engine.generate_description(request).await?;
    Ok(Json(DescriptionResponse { description }))
}
