//! Tavern engine — API error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tavern_core::error::DomainError;
use thiserror::Error;

/// Startup and runtime errors for the API server.
#[derive(Debug, Error)]
pub enum AppError {
    /// A required environment variable is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Settings or snapshot store could not be initialized.
    #[error("engine error: {0}")]
    Engine(#[from] DomainError),

    /// Network binding or I/O error.
    #[error("server error: {0}")]
    Server(#[from] std::io::Error),
}

/// JSON body returned for error responses.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Machine-readable error code.
    pub error: &'static str,
    /// Human-readable error message.
    pub message: String,
}

/// HTTP-layer wrapper around `DomainError` that implements `IntoResponse`.
#[derive(Debug)]
pub struct ApiError(pub DomainError);

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            DomainError::MalformedCommand { .. } | DomainError::MalformedPayload { .. } => {
                (StatusCode::BAD_REQUEST, "malformed_command")
            }
            DomainError::UnknownPath(_) | DomainError::UnsupportedAction(_) => {
                (StatusCode::BAD_REQUEST, "unsupported_command")
            }
            DomainError::OutOfScopeWrite { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "out_of_scope_write")
            }
            DomainError::EconomicInvariantViolation { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "invariant_violation")
            }
            DomainError::VersionConflict { .. } => (StatusCode::CONFLICT, "version_conflict"),
            DomainError::ServiceUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
            DomainError::Aborted => (StatusCode::CONFLICT, "turn_aborted"),
            DomainError::SnapshotNotFound(_) => (StatusCode::NOT_FOUND, "snapshot_not_found"),
            DomainError::TurnInProgress => (StatusCode::CONFLICT, "turn_in_progress"),
            DomainError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            DomainError::Infrastructure(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "infrastructure_error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code) = self.status_and_code();

        let body = ErrorBody {
            error: error_code,
            message: self.0.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    fn status_of(err: DomainError) -> StatusCode {
        let response = ApiError(err).into_response();
        response.status()
    }

    #[test]
    fn test_snapshot_not_found_maps_to_404() {
        assert_eq!(
            status_of(DomainError::SnapshotNotFound("slot-1".into())),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_turn_in_progress_maps_to_409() {
        assert_eq!(status_of(DomainError::TurnInProgress), StatusCode::CONFLICT);
    }

    #[test]
    fn test_service_unavailable_maps_to_503() {
        assert_eq!(
            status_of(DomainError::ServiceUnavailable("HTTP 502".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_validation_maps_to_400() {
        assert_eq!(
            status_of(DomainError::Validation("bad input".into())),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_invariant_violation_maps_to_422() {
        assert_eq!(
            status_of(DomainError::EconomicInvariantViolation {
                code: "MONEY_NEGATIVE".into(),
                path: "character.currency".into(),
            }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn test_infrastructure_maps_to_500() {
        assert_eq!(
            status_of(DomainError::Infrastructure("disk full".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_code_names_the_variant() {
        let (_, code) = ApiError(DomainError::Aborted).status_and_code();

        assert_eq!(code, "turn_aborted");
    }
}
