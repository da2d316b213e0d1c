//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use domain::DomainError;
use saga::SagaError;
use saga_store::SagaStoreError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Saga operation error.
    Saga(SagaError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Saga(err) => saga_error_to_response(err),
        };

        if status.is_server_error() {
            tracing::error!(%status, error = %message, "request failed");
        }

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn saga_error_to_response(err: SagaError) -> (StatusCode, String) {
    let status = match &err {
        SagaError::NotFound(_) => StatusCode::NOT_FOUND,
        SagaError::Creation { .. } => StatusCode::CONFLICT,
        SagaError::Domain(_) => StatusCode::BAD_REQUEST,
        SagaError::Store(store_err) => match store_err {
            SagaStoreError::NotFound(_) => StatusCode::NOT_FOUND,
            SagaStoreError::AlreadyExists(_)
            | SagaStoreError::ConcurrencyConflict { .. }
            | SagaStoreError::StatusConflict { .. } => StatusCode::CONFLICT,
            SagaStoreError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
        SagaError::PermanentFailure { .. } | SagaError::ReconciliationRequired { .. } => {
            StatusCode::BAD_GATEWAY
        }
        SagaError::Scheduler(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, err.to_string())
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

impl From<SagaStoreError> for ApiError {
    fn from(err: SagaStoreError) -> Self {
        ApiError::Saga(SagaError::Store(err))
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use common::ActivationId;

    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                SagaError::NotFound(ActivationId::new(1)),
                StatusCode::NOT_FOUND,
            ),
            (
                SagaError::Creation {
                    activation_id: ActivationId::new(1),
                    reason: "mismatch".to_string(),
                },
                StatusCode::CONFLICT,
            ),
            (
                SagaError::Domain(DomainError::InvalidAmount(-1.0)),
                StatusCode::BAD_REQUEST,
            ),
            (
                SagaError::Store(SagaStoreError::NotFound(ActivationId::new(1))),
                StatusCode::NOT_FOUND,
            ),
            (
                SagaError::Scheduler("stopped".to_string()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(saga_error_to_response(err).0, expected);
        }
    }
}
