use axum::{
    extract::{
        rejection::{PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

use crate::application::services::bridge_service::{
    AccountInfo, AccountPositions, AccountTrades, BridgeService, HealthReport, RestartAccepted,
};
use crate::domain::entities::account::Login;
use crate::domain::entities::recovery_job::RecoveryJob;
use crate::domain::errors::{BridgeError, ErrorSeverity};
use crate::domain::services::summary::AccountsSummary;
use crate::domain::services::watchdog::WatchdogStatus;
use crate::rate_limit::{rate_limit_middleware, GlobalRateLimiter};

/// Query parameters for list endpoints
#[derive(Debug, Serialize, Deserialize)]
pub struct LimitQuery {
    /// Trades: default 100, max 1000. Jobs: default 20.
    pub limit: Option<usize>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// HTTP mapping of [`BridgeError`]
pub struct ApiError(pub BridgeError);

impl From<BridgeError> for ApiError {
    fn from(e: BridgeError) -> Self {
        ApiError(e)
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError(BridgeError::InvalidRequest(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError(BridgeError::InvalidRequest(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BridgeError::AccountNotFound(_) | BridgeError::JobNotFound(_) => StatusCode::NOT_FOUND,
            BridgeError::Conflict { .. } => StatusCode::CONFLICT,
            BridgeError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if self.0.severity() == ErrorSeverity::Critical {
            error!("Request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Bridge API routes; the restart endpoint sits behind `limiter`
pub fn router(service: Arc<BridgeService>, limiter: GlobalRateLimiter) -> Router {
    let restart = Router::new()
        .route("/system/full-restart", post(trigger_full_restart))
        .route_layer(middleware::from_fn_with_state(limiter, rate_limit_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/accounts/summary", get(accounts_summary))
        .route("/account/:login/info", get(account_info))
        .route("/account/:login/trades", get(account_trades))
        .route("/account/:login/positions", get(account_positions))
        .route("/system/jobs", get(list_jobs))
        .route("/system/jobs/:job_id", get(job_status))
        .route("/watchdog", get(watchdog_status))
        .merge(restart)
        .with_state(service)
}

async fn health(State(service): State<Arc<BridgeService>>) -> Json<HealthReport> {
    Json(service.health().await)
}

async fn accounts_summary(State(service): State<Arc<BridgeService>>) -> Json<AccountsSummary> {
    Json(service.summary().await)
}

async fn account_info(
    State(service): State<Arc<BridgeService>>,
    login: Result<Path<Login>, PathRejection>,
) -> Result<Json<AccountInfo>, ApiError> {
    let Path(login) = login?;
    Ok(Json(service.account_info(login).await?))
}

async fn account_trades(
    State(service): State<Arc<BridgeService>>,
    login: Result<Path<Login>, PathRejection>,
    params: Result<Query<LimitQuery>, QueryRejection>,
) -> Result<Json<AccountTrades>, ApiError> {
    let Path(login) = login?;
    let Query(params) = params?;
    Ok(Json(service.account_trades(login, params.limit).await?))
}

async fn account_positions(
    State(service): State<Arc<BridgeService>>,
    login: Result<Path<Login>, PathRejection>,
) -> Result<Json<AccountPositions>, ApiError> {
    let Path(login) = login?;
    Ok(Json(service.account_positions(login).await?))
}

async fn trigger_full_restart(
    State(service): State<Arc<BridgeService>>,
) -> Result<(StatusCode, Json<RestartAccepted>), ApiError> {
    let accepted = service.trigger_restart().await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn job_status(
    State(service): State<Arc<BridgeService>>,
    Path(job_id): Path<String>,
) -> Result<Json<RecoveryJob>, ApiError> {
    Ok(Json(service.job(&job_id).await?))
}

async fn list_jobs(
    State(service): State<Arc<BridgeService>>,
    params: Result<Query<LimitQuery>, QueryRejection>,
) -> Result<Json<Vec<RecoveryJob>>, ApiError> {
    let Query(params) = params?;
    Ok(Json(service.jobs(params.limit).await))
}

async fn watchdog_status(
    State(service): State<Arc<BridgeService>>,
) -> Result<Json<WatchdogStatus>, (StatusCode, Json<ErrorResponse>)> {
    service.watchdog_status().await.map(Json).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "watchdog is disabled".to_string(),
            }),
        )
    })
}
