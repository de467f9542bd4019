use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};

use crate::admin::AdminState;
use crate::error::GatewayError;
use crate::gateway::ServiceHealth;
use crate::resilience::QuotaStatus;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub services: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    pub key: Option<String>,
    pub prefix: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub removed: usize,
}

/// JSON error body with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        let status = match &e {
            GatewayError::UnknownService(_) | GatewayError::UnknownResource(_) => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        services: state.gateway.services(),
    })
}

pub async fn get_all_health(
    State(state): State<AdminState>,
) -> Result<Json<Vec<ServiceHealth>>, ApiError> {
    let services = state.gateway.services();
    let report = join_all(services.iter().map(|s| state.gateway.health(s)))
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(report))
}

pub async fn get_service_health(
    State(state): State<AdminState>,
    Path(service): Path<String>,
) -> Result<Json<ServiceHealth>, ApiError> {
    Ok(Json(state.gateway.health(&service).await?))
}

pub async fn get_quota(
    State(state): State<AdminState>,
    Path(resource): Path<String>,
) -> Result<Json<QuotaStatus>, ApiError> {
    Ok(Json(state.gateway.quotas().status(&resource).await?))
}

pub async fn invalidate_cache(
    State(state): State<AdminState>,
    Json(body): Json<InvalidateRequest>,
) -> Result<Json<InvalidateResponse>, ApiError> {
    let cache = state.gateway.cache();
    let removed = match (body.key, body.prefix) {
        (Some(key), None) => cache.invalidate(&key).await.map(usize::from),
        (None, Some(prefix)) => cache.invalidate_prefix(&prefix).await,
        _ => return Err(ApiError::bad_request("exactly one of 'key' or 'prefix' is required")),
    }
    .map_err(|e| ApiError {
        status: StatusCode::SERVICE_UNAVAILABLE,
        message: e.to_string(),
    })?;

    Ok(Json(InvalidateResponse { removed }))
}
