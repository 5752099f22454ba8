use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use super::ws::websocket_handler;
use crate::errors::EngineError;
use crate::models::{GateOutcome, MetricsSnapshot, SessionView};
use crate::optimizer::OptimizerState;
use crate::orchestrator::{PhaseOrchestrator, WithdrawalOutcome};
use crate::preflight::PreflightReport;
use crate::provider::{EndpointHealth, RpcProvider};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<PhaseOrchestrator>,
    /// Present when running against real RPC endpoints
    pub rpc: Option<Arc<RpcProvider>>,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/session", get(get_session))
        .route("/api/session/start", post(post_start))
        .route("/api/session/resolve/wallet", post(post_resolve_wallet))
        .route("/api/session/resolve/connection", post(post_retry_connection))
        .route("/api/session/reset", post(post_reset))
        .route("/api/simulation/start", post(post_start_simulation))
        .route("/api/live/confirm", post(post_confirm_live))
        .route("/api/live/withdraw", post(post_withdraw))
        .route("/api/metrics", get(get_metrics))
        .route("/api/optimizer", get(get_optimizer))
        .route("/api/preflight", get(get_preflight))
        .route("/api/preflight/run", post(post_run_preflight))
        .route("/api/provider/endpoints", get(get_provider_endpoints))
        .route("/ws", get(websocket_handler))
        .with_state(state)
}

// ===== Route Handlers =====

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn get_session(State(state): State<AppState>) -> Json<SessionView> {
    Json(state.orchestrator.view())
}

async fn post_start(State(state): State<AppState>) -> Result<Json<SessionView>, ApiError> {
    state.orchestrator.start()?;
    Ok(Json(state.orchestrator.view()))
}

async fn post_resolve_wallet(
    State(state): State<AppState>,
    Json(req): Json<WalletRequest>,
) -> Result<Json<SessionView>, ApiError> {
    state.orchestrator.resolve_wallet(&req.address)?;
    Ok(Json(state.orchestrator.view()))
}

async fn post_retry_connection(
    State(state): State<AppState>,
) -> Result<Json<SessionView>, ApiError> {
    state.orchestrator.retry_connection().await?;
    Ok(Json(state.orchestrator.view()))
}

async fn post_reset(State(state): State<AppState>) -> Json<SessionView> {
    state.orchestrator.reset();
    Json(state.orchestrator.view())
}

async fn post_start_simulation(
    State(state): State<AppState>,
) -> Result<Json<SessionView>, ApiError> {
    state.orchestrator.start_simulation().await?;
    Ok(Json(state.orchestrator.view()))
}

/// Gate refusals are a normal outcome, not an error
async fn post_confirm_live(State(state): State<AppState>) -> Result<Json<GateOutcome>, ApiError> {
    Ok(Json(state.orchestrator.confirm_live().await?))
}

async fn post_withdraw(
    State(state): State<AppState>,
    Json(req): Json<WithdrawRequest>,
) -> Result<Json<WithdrawalOutcome>, ApiError> {
    Ok(Json(state.orchestrator.withdraw(req.amount).await?))
}

async fn get_metrics(State(state): State<AppState>) -> Result<Json<MetricsSnapshot>, ApiError> {
    state
        .orchestrator
        .latest_metrics()
        .map(|m| Json((*m).clone()))
        .ok_or_else(|| ApiError::NotFound("no metrics yet".to_string()))
}

async fn get_optimizer(State(state): State<AppState>) -> Json<OptimizerState> {
    Json(state.orchestrator.optimizer_state())
}

async fn get_preflight(State(state): State<AppState>) -> Result<Json<PreflightReport>, ApiError> {
    state
        .orchestrator
        .last_preflight()
        .map(|r| Json((*r).clone()))
        .ok_or_else(|| ApiError::NotFound("preflight has not run".to_string()))
}

async fn post_run_preflight(State(state): State<AppState>) -> Json<PreflightReport> {
    Json(state.orchestrator.run_preflight().await)
}

async fn get_provider_endpoints(State(state): State<AppState>) -> Json<Vec<EndpointHealth>> {
    Json(
        state
            .rpc
            .as_ref()
            .map(|rpc| rpc.endpoint_health())
            .unwrap_or_default(),
    )
}

// ===== Request/Response Types =====

#[derive(Deserialize)]
struct WalletRequest {
    address: String,
}

#[derive(Deserialize)]
struct WithdrawRequest {
    amount: f64,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

// ===== Error Handling =====

#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    Internal(anyhow::Error),
    NotFound(String),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Engine(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Engine(err) => {
                let status = match err {
                    EngineError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                    EngineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                    EngineError::GateViolation { .. } | EngineError::InvalidState { .. } => {
                        StatusCode::CONFLICT
                    }
                    EngineError::PersistenceCorrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.to_string())
            }
            ApiError::Internal(err) => {
                tracing::error!("Internal error: {:#}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionState;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (EngineError::unavailable("down"), StatusCode::SERVICE_UNAVAILABLE),
            (EngineError::invalid_input("bad"), StatusCode::BAD_REQUEST),
            (
                EngineError::InvalidState {
                    command: "withdraw",
                    state: SessionState::Idle,
                },
                StatusCode::CONFLICT,
            ),
        ];
        for (err, expected) in cases {
            let resp = ApiError::from(err).into_response();
            assert_eq!(resp.status(), expected);
        }

        let resp = ApiError::from(anyhow::anyhow!("boom")).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
