// Application error taxonomy and its mapping onto HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::gateway::GatewayError;
use crate::rate_limit::RateLimitError;

/// Every failure a handler can surface. Validation and not-found errors are
/// raised before any state is touched; gateway errors short-circuit before
/// any log mutation; persistence errors leave the battle row unchanged.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("model gateway request failed: {0}")]
    Gateway(#[from] GatewayError),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("rate limit exceeded: max {max} {what}")]
    RateLimited { max: usize, what: String },
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Persistence(e.to_string())
    }
}

impl From<RateLimitError> for AppError {
    fn from(e: RateLimitError) -> Self {
        AppError::RateLimited {
            max: e.max,
            what: e.limit_type.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AppError::NotFound(_) => (
                StatusCode::NOT_FOUND,
                json!({ "error": self.to_string() }),
            ),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, json!({ "error": msg })),
            AppError::Gateway(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "Failed to call model gateway", "details": e.to_string() }),
            ),
            AppError::Persistence(detail) => {
                tracing::error!("Persistence error: {detail}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal server error" }),
                )
            }
            AppError::RateLimited { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({ "error": self.to_string() }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

/// Whether a database error is a uniqueness-constraint violation, so callers
/// creating rows can report 409 instead of 500.
pub fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.to_string().contains("UNIQUE")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: AppError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_of(AppError::NotFound("battle")), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(AppError::Validation("missing 'text'".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(AppError::Conflict("username taken".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(AppError::Persistence("disk full".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_of(AppError::Gateway(GatewayError::RequestFailed(
                "timeout".into()
            ))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_of(AppError::RateLimited {
                max: 60,
                what: "turn submissions per hour".into()
            }),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn test_not_found_message() {
        assert_eq!(AppError::NotFound("battle").to_string(), "battle not found");
    }
}
