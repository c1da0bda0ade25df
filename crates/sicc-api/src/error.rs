//! Mapping of core errors onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use sicc_types::error::SiccError;

/// Error returned by every handler.
#[derive(Debug)]
pub struct ApiError(pub SiccError);

impl ApiError {
    /// A 400 for malformed path or query input.
    pub fn bad_input(message: impl Into<String>) -> Self {
        Self(SiccError::Validation(message.into()))
    }

    /// Status code for the wrapped error's kind.
    pub fn status(&self) -> StatusCode {
        match self.0.kind() {
            "not_found" => StatusCode::NOT_FOUND,
            "validation" => StatusCode::BAD_REQUEST,
            "conflict" | "cancelled" => StatusCode::CONFLICT,
            "upstream" => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<SiccError> for ApiError {
    fn from(e: SiccError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self.0, "Request failed");
        }
        (
            status,
            Json(serde_json::json!({
                "error": self.0.to_string(),
                "kind": self.0.kind(),
            })),
        )
            .into_response()
    }
}

/// Result type of handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use sicc_types::learning::ReviewFailure;

    #[test]
    fn test_status_by_kind() {
        assert_eq!(
            ApiError(SiccError::not_found("agent", "x")).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::bad_input("bad id").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError(SiccError::ReviewFailed(ReviewFailure::NotPending)).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(ApiError(SiccError::Cancelled).status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError(SiccError::Upstream("model".into())).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError(SiccError::Internal("boom".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
