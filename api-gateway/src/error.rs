// ==============================================================================
// error.rs - API Error Mapping
// ==============================================================================
// Description: Error taxonomy for the HTTP boundary with JSON error bodies
// Author: Matt Barham
// Created: 2025-12-15
// Modified: 2026-01-23
// Version: 1.1.0
// ==============================================================================
// Every error renders as {"error": {"code": ..., "message": ...}} with a
// stable code drawn from the documented set.
// ==============================================================================

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use varda_core::store::{self, StoreError};

/// API errors
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("Resource not found")]
    NotFound,

    #[error("{0}")]
    Conflict(String),

    #[error("Request entity exceeds the configured maximum size")]
    EntityTooLarge,

    #[error("Requested range is not satisfiable")]
    UnsatisfiableRange,

    #[error("No acceptable API version")]
    NoAcceptableVersion,

    #[error("{0}")]
    NotImplemented(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::NotFound => "not_found",
            ApiError::Conflict(_) => "integrity_conflict",
            ApiError::EntityTooLarge => "entity_too_large",
            ApiError::UnsatisfiableRange => "unsatisfiable_range",
            ApiError::NoAcceptableVersion => "no_acceptable_version",
            ApiError::NotImplemented(_) => "not_implemented",
            ApiError::Internal(_) => "internal_server_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::EntityTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::UnsatisfiableRange => StatusCode::RANGE_NOT_SATISFIABLE,
            ApiError::NoAcceptableVersion => StatusCode::NOT_ACCEPTABLE,
            ApiError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        }));

        // Basic is advertised on 401 so command-line clients can retry
        // with credentials.
        if status == StatusCode::UNAUTHORIZED {
            (
                status,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"varda\"")],
                body,
            )
                .into_response()
        } else {
            (status, body).into_response()
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(_) => ApiError::NotFound,
            StoreError::PendingTasks
            | StoreError::MissingVariation
            | StoreError::MissingCoverage
            | StoreError::DuplicateImport => ApiError::Conflict(error.to_string()),
            StoreError::Binning(e) => ApiError::BadRequest(e.to_string()),
            StoreError::Database(e) if store::is_unique_violation(&e) => {
                ApiError::Conflict("Resource already exists".to_string())
            }
            StoreError::Database(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(error: sqlx::Error) -> Self {
        if store::is_unique_violation(&error) {
            ApiError::Conflict("Resource already exists".to_string())
        } else {
            ApiError::Internal(error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_statuses() {
        assert_eq!(ApiError::NotFound.code(), "not_found");
        assert_eq!(ApiError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::Conflict("x".to_string()).code(),
            "integrity_conflict"
        );
        assert_eq!(
            ApiError::Conflict("x".to_string()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::UnsatisfiableRange.status(),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
        assert_eq!(ApiError::EntityTooLarge.code(), "entity_too_large");
    }

    #[test]
    fn test_store_error_mapping() {
        assert!(matches!(
            ApiError::from(StoreError::DuplicateImport),
            ApiError::Conflict(_)
        ));
        assert!(matches!(
            ApiError::from(StoreError::NotFound("Sample")),
            ApiError::NotFound
        ));
        assert!(matches!(
            ApiError::from(StoreError::PendingTasks),
            ApiError::Conflict(_)
        ));
    }
}
