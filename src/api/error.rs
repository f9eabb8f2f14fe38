//! HTTP 错误响应

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::error::{AppError, StoreError};

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

/// 把 `AppError` 映射为 HTTP 状态码和 JSON 错误体
#[derive(Debug)]
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(error: AppError) -> Self {
        Self(error)
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            AppError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
            AppError::Store(StoreError::RequestNotFound { .. }) => {
                (StatusCode::NOT_FOUND, "request_not_found")
            }
            AppError::Store(StoreError::DuplicateRequest { .. }) => {
                (StatusCode::CONFLICT, "duplicate_request")
            }
            AppError::Store(StoreError::InvalidTransition { .. }) => {
                (StatusCode::CONFLICT, "invalid_transition")
            }
            AppError::Launch(_) => (StatusCode::SERVICE_UNAVAILABLE, "launch_failed"),
            AppError::Store(_) | AppError::Config(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            error!("HTTP 请求处理失败: {}", self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: code.to_string(),
                message: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let not_found = ApiError(AppError::Store(StoreError::not_found("r-1")));
        assert_eq!(not_found.status_and_code().0, StatusCode::NOT_FOUND);

        let duplicate = ApiError(AppError::Store(StoreError::DuplicateRequest {
            request_id: "r-1".into(),
        }));
        assert_eq!(duplicate.status_and_code().0, StatusCode::CONFLICT);

        let invalid = ApiError(AppError::InvalidInput("documentRef".into()));
        assert_eq!(invalid.status_and_code().0, StatusCode::BAD_REQUEST);
    }
}
