//! HTTP query and control surface.
//!
//! Callers identify as a meter owner with the `x-owner-id` header. Without it,
//! history queries are unscoped; bind this router to an operator-only address.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::{
    persistence::RepositoryError,
    query::{HistoryScope, QueryError, QueryService},
    settlement::{SettlementError, SettlementOrchestrator, SettlementOutcome},
};

const OWNER_HEADER: &str = "x-owner-id";

#[derive(Clone)]
pub struct ApiState {
    pub query: Arc<QueryService>,
    pub orchestrator: Arc<SettlementOrchestrator>,
}

pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

impl From<SettlementError> for ApiError {
    fn from(e: SettlementError) -> Self {
        let status = match &e {
            SettlementError::UnknownMeter(_) | SettlementError::NotFound(_) => StatusCode::NOT_FOUND,
            SettlementError::Forbidden { .. } => StatusCode::FORBIDDEN,
            SettlementError::Repository(RepositoryError::NotFound(_)) => StatusCode::NOT_FOUND,
            SettlementError::Repository(RepositoryError::AlreadyFinal { .. })
            | SettlementError::NotSubmitted(_)
            | SettlementError::TxHashMismatch { .. } => StatusCode::CONFLICT,
            SettlementError::Ledger(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::Settlement(inner) => inner.into(),
            QueryError::ArchivalDisabled => ApiError(StatusCode::NOT_FOUND, "archival is not enabled".to_string()),
            other => {
                tracing::error!(error = %other, "query failed");
                ApiError(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
            }
        }
    }
}

fn owner_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/settlements", get(settlement_history))
        .route("/settlements/:settlement_id", get(get_settlement))
        .route("/settlements/:settlement_id/confirm", post(confirm_settlement))
        .route("/meters/:meter_id/settle", post(settle_meter))
        .route("/meters/:meter_id/estimate", get(settlement_estimate))
        .route("/meters/:meter_id/hourly", get(hourly_history))
        .route("/archive/stats", get(archive_stats))
        .route("/health", get(health))
        .with_state(state)
}

pub async fn serve(bind_addr: &str, state: ApiState) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid api bind addr: {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "query api listening");

    let app = router(state);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app.into_make_service()).await {
            tracing::error!(error = %e, "query api server error");
        }
    });
    Ok(())
}

#[derive(Deserialize)]
struct HistoryParams {
    meter_id: Option<String>,
    limit: Option<i64>,
}

async fn settlement_history(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(params): Query<HistoryParams>,
) -> Result<impl IntoResponse, ApiError> {
    let scope = owner_id(&headers).map_or(HistoryScope::All, HistoryScope::Owner);
    let rows = state
        .query
        .settlement_history(scope, params.meter_id, params.limit)
        .await?;
    Ok(Json(rows))
}

async fn get_settlement(
    State(state): State<ApiState>,
    Path(settlement_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.query.settlement(&settlement_id).await? {
        Some(record) => Ok(Json(record)),
        None => Err(ApiError(StatusCode::NOT_FOUND, format!("settlement {settlement_id} not found"))),
    }
}

#[derive(Deserialize)]
struct ConfirmBody {
    tx_hash: String,
    success: bool,
    etk_amount: Option<f64>,
}

async fn confirm_settlement(
    State(state): State<ApiState>,
    Path(settlement_id): Path<String>,
    Json(body): Json<ConfirmBody>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .orchestrator
        .confirm_settlement(&settlement_id, &body.tx_hash, body.success, body.etk_amount)
        .await?;
    Ok(Json(record))
}

async fn settle_meter(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(meter_id): Path<String>,
) -> Result<Response, ApiError> {
    let Some(caller) = owner_id(&headers) else {
        return Err(ApiError(StatusCode::UNAUTHORIZED, format!("missing {OWNER_HEADER} header")));
    };

    let outcome = state.orchestrator.settle_meter_manual(&meter_id, &caller).await?;
    let response = match outcome {
        SettlementOutcome::Submitted(record) => (StatusCode::ACCEPTED, Json(record)).into_response(),
        SettlementOutcome::Failed(record) => (StatusCode::BAD_GATEWAY, Json(record)).into_response(),
        SettlementOutcome::InFlight => ApiError(StatusCode::CONFLICT, "settlement already in progress".into()).into_response(),
        other => (
            StatusCode::OK,
            Json(serde_json::json!({ "settled": false, "reason": format!("{other:?}") })),
        )
            .into_response(),
    };
    Ok(response)
}

async fn settlement_estimate(
    State(state): State<ApiState>,
    Path(meter_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.query.settlement_estimate(&meter_id).await? {
        Some(estimate) => Ok(Json(estimate)),
        None => Err(ApiError(StatusCode::NOT_FOUND, format!("no live reading for meter {meter_id}"))),
    }
}

#[derive(Deserialize)]
struct HourlyParams {
    hours: Option<u32>,
}

async fn hourly_history(
    State(state): State<ApiState>,
    Path(meter_id): Path<String>,
    Query(params): Query<HourlyParams>,
) -> Result<impl IntoResponse, ApiError> {
    let rows = state
        .query
        .hourly_history(&meter_id, params.hours.unwrap_or(24))
        .await?;
    Ok(Json(rows))
}

async fn archive_stats(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.query.archive_stats().await?))
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let report = state.query.health().await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}
