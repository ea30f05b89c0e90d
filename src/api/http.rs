//! HTTP serving boundary.
//!
//! `POST /predict` takes a JSON array of `{x1..x10}` objects and answers
//! `{"labels": [..]}`. `GET /health` reports the loaded version and
//! `POST /reload` swaps in the current Production entry. Requests snapshot the
//! active model once, so a reload never splits a batch across two models.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tracing::{error, info};

use crate::common::error::{ErrorCode, PersonaError, Result};
use crate::data::domain::FeatureVector;
use crate::inference::domain::{ActiveModel, FeatureRow, PredictResponse, Predictor};
use crate::inference::service::reload;
use crate::registry::domain::ModelRegistry;
use crate::training::domain::RunHistory;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub active: ActiveModel,
    pub registry: Arc<dyn ModelRegistry>,
    pub history: Arc<dyn RunHistory>,
    pub model_name: String,
}

#[derive(Serialize)]
struct HealthResp {
    status: &'static str,
    model_name: String,
    version: Option<u32>,
    run_id: Option<String>,
}

#[derive(Serialize)]
struct ReloadResp {
    model_name: String,
    version: u32,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: u32,
}

struct ApiError(PersonaError);

impl From<PersonaError> for ApiError {
    fn from(err: PersonaError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.code() {
            ErrorCode::NotFound => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorCode::ExternalService => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            code: self.0.code() as u32,
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/predict", post(predict))
        .route("/health", get(health))
        .route("/reload", post(reload_model))
        .with_state(state)
}

async fn predict(
    State(state): State<AppState>,
    Json(rows): Json<Vec<FeatureRow>>,
) -> std::result::Result<Json<PredictResponse>, ApiError> {
    let model = state
        .active
        .current()
        .ok_or_else(|| PersonaError::not_found("loaded model", &state.model_name))?;
    let features: Vec<FeatureVector> = rows.into_iter().map(FeatureVector::from).collect();
    let labels = model.predict(&features)?;
    Ok(Json(PredictResponse { labels }))
}

async fn health(State(state): State<AppState>) -> Json<HealthResp> {
    let current = state.active.current();
    Json(HealthResp {
        status: if current.is_some() { "ok" } else { "no_model" },
        model_name: state.model_name.clone(),
        version: current.as_ref().map(|m| m.version),
        run_id: current.map(|m| m.run_id.to_string()),
    })
}

async fn reload_model(
    State(state): State<AppState>,
) -> std::result::Result<Json<ReloadResp>, ApiError> {
    let model_name = state.model_name.clone();
    // Registry and history hit SQLite; keep that off the async workers.
    let version = tokio::task::spawn_blocking(move || {
        reload(
            &state.active,
            state.registry.as_ref(),
            state.history.as_ref(),
            &state.model_name,
        )
    })
    .await
    .map_err(|err| PersonaError::invalid(format!("reload task failed: {err}")))??;
    Ok(Json(ReloadResp { model_name, version }))
}

/// Bind and serve until the process stops.
pub async fn serve(bind: &str, state: AppState) -> Result<()> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|err| PersonaError::Config(format!("serve.bind '{bind}': {err}")))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, model_name = %state.model_name, "prediction api started");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
