//! Operational endpoints and the error envelope shared by every handler.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use storefront_core::error::LoyaltyError;
use storefront_loyalty::LoyaltyEngine;
use tracing::{error, warn};
use utoipa::ToSchema;

/// Shared application state for operational handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<LoyaltyEngine>,
    pub node_id: String,
    pub start_time: Instant,
}

/// GET /health — Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Operations",
    responses((status = 200, description = "Service is healthy", body = HealthResponse))
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        accounts: state.engine.account_count(),
    })
}

/// GET /ready — Readiness probe.
/// The engine is built only after the journal has been replayed, so a
/// running router is ready.
#[utoipa::path(
    get,
    path = "/ready",
    tag = "Operations",
    responses((status = 200, description = "Ready to accept traffic"))
)]
pub async fn readiness() -> StatusCode {
    StatusCode::OK
}

/// GET /live — Liveness probe.
#[utoipa::path(
    get,
    path = "/live",
    tag = "Operations",
    responses((status = 200, description = "Process is alive"))
)]
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
    pub accounts: usize,
}

/// Error returned by handlers: a status code plus the JSON envelope.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ApiError {
    pub fn new(status: StatusCode, error: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                error: error.to_string(),
                message: message.into(),
            },
        }
    }
}

impl From<LoyaltyError> for ApiError {
    fn from(e: LoyaltyError) -> Self {
        let (status, code) = match &e {
            LoyaltyError::InvalidPointsKind { .. } => (StatusCode::BAD_REQUEST, "invalid_points"),
            LoyaltyError::InvalidReferral(_) => (StatusCode::BAD_REQUEST, "invalid_referral"),
            LoyaltyError::InvalidEventDate(_) => (StatusCode::BAD_REQUEST, "invalid_event_date"),
            LoyaltyError::AccountNotFound(_) => (StatusCode::NOT_FOUND, "account_not_found"),
            LoyaltyError::InsufficientBalance { .. } => {
                (StatusCode::CONFLICT, "insufficient_balance")
            }
            LoyaltyError::DuplicateAccrual { .. } => (StatusCode::CONFLICT, "duplicate_accrual"),
            LoyaltyError::AccountInactive(_) => (StatusCode::CONFLICT, "account_inactive"),
            LoyaltyError::BelowMinimumRedemption { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "below_minimum_redemption")
            }
            LoyaltyError::InvalidRedemption(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "invalid_redemption")
            }
            LoyaltyError::Configuration(_)
            | LoyaltyError::NoTierConfigured { .. }
            | LoyaltyError::Journal(_)
            | LoyaltyError::Serialization(_)
            | LoyaltyError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        if status.is_server_error() {
            error!(error = %e, "Loyalty request failed");
            metrics::counter!("api.errors").increment(1);
            // Internal details stay in the logs.
            return Self::new(status, code, "Internal processing error");
        }

        if e.is_user_correctable() {
            metrics::counter!("api.validation_errors").increment(1);
        }
        warn!(error = %e, status = status.as_u16(), "Loyalty request rejected");
        Self::new(status, code, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (
                LoyaltyError::InsufficientBalance {
                    requested: 100,
                    available: 50,
                },
                StatusCode::CONFLICT,
            ),
            (
                LoyaltyError::AccountNotFound("u".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                LoyaltyError::BelowMinimumRedemption {
                    requested: 10,
                    minimum: 100,
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                LoyaltyError::InvalidReferral("self".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                LoyaltyError::InvalidEventDate("2099-01-01".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                LoyaltyError::Journal("disk".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn test_internal_errors_hide_details() {
        let api = ApiError::from(LoyaltyError::Journal("/var/data is full".into()));
        assert_eq!(api.body.error, "internal_error");
        assert!(!api.body.message.contains("/var/data"));
    }
}
