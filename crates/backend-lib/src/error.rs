// crates/backend-lib/src/error.rs

//! Central error type + Axum integration.
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Application error types with error codes and context
#[derive(Error, Debug)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("poll not found: {0}")]
    PollNotFound(u64),

    #[error("a poll is already active for this session")]
    PollActive,

    #[error("client has already voted on this poll")]
    AlreadyVoted,

    #[error("option index out of range")]
    InvalidOption,

    #[error("connection does not own this session")]
    NotSessionOwner,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::InvalidOption => StatusCode::BAD_REQUEST,
            AppError::NotFound(_)
            | AppError::SessionNotFound(_)
            | AppError::PollNotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_)
            | AppError::PollActive
            | AppError::AlreadyVoted
            | AppError::NotSessionOwner => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the NACK / response error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VAL_001",
            AppError::InvalidOption => "VAL_002",
            AppError::Conflict(_) => "CONFLICT_001",
            AppError::AlreadyVoted => "CONFLICT_002",
            AppError::PollActive => "CONFLICT_003",
            AppError::NotSessionOwner => "CONFLICT_004",
            AppError::NotFound(_) => "NF_001",
            AppError::SessionNotFound(_) => "NF_002",
            AppError::PollNotFound(_) => "NF_003",
            AppError::Storage(_) => "STORE_001",
            AppError::Io(_) => "IO_001",
            AppError::Json(_) => "JSON_001",
            AppError::Internal(_) => "INT_001",
        }
    }

    /// Get a sanitized message suitable for production use
    pub fn sanitized_message(&self) -> String {
        match self {
            AppError::Validation(_) | AppError::InvalidOption => {
                "Invalid input provided".to_string()
            },
            AppError::Conflict(_)
            | AppError::AlreadyVoted
            | AppError::PollActive
            | AppError::NotSessionOwner => self.to_string(),
            AppError::NotFound(_)
            | AppError::SessionNotFound(_)
            | AppError::PollNotFound(_) => "Resource not found".to_string(),
            AppError::Json(_) => "Invalid request format".to_string(),
            _ => "An internal server error occurred".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();

        // Use detailed messages in development, sanitized in production
        let message = if cfg!(debug_assertions) {
            self.to_string()
        } else {
            self.sanitized_message()
        };

        let body = serde_json::json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        });

        (status, axum::Json(body)).into_response()
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for AppError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        AppError::Internal("Failed to send message".to_string())
    }
}

impl From<String> for AppError {
    fn from(msg: String) -> Self {
        AppError::Internal(msg)
    }
}

impl From<&str> for AppError {
    fn from(msg: &str) -> Self {
        AppError::Internal(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_app_error_display() {
        let validation = AppError::Validation("question too long".to_string());
        assert_eq!(validation.to_string(), "validation error: question too long");

        let io_error = AppError::Io(IoError::new(ErrorKind::NotFound, "File not found"));
        assert!(io_error.to_string().contains("IO error"));

        assert_eq!(
            AppError::AlreadyVoted.to_string(),
            "client has already voted on this poll"
        );
    }

    #[test]
    fn test_app_error_status_codes() {
        assert_eq!(
            AppError::Validation("bad".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::SessionNotFound("s1".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(AppError::PollNotFound(7).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::AlreadyVoted.status_code(), StatusCode::CONFLICT);
        assert_eq!(AppError::NotSessionOwner.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            AppError::Internal("test".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_app_error_error_codes() {
        assert_eq!(AppError::Validation("bad".to_string()).error_code(), "VAL_001");
        assert_eq!(AppError::InvalidOption.error_code(), "VAL_002");
        assert_eq!(AppError::AlreadyVoted.error_code(), "CONFLICT_002");
        assert_eq!(AppError::PollActive.error_code(), "CONFLICT_003");
        assert_eq!(AppError::PollNotFound(1).error_code(), "NF_003");

        let json_err: serde_json::Error =
            serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        assert_eq!(AppError::Json(json_err).error_code(), "JSON_001");
    }

    #[test]
    fn test_app_error_into_response() {
        let error = AppError::PollNotFound(99);
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response_headers = response.headers();
        assert!(response_headers
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .contains("application/json"));
    }

    #[test]
    fn test_error_from_impls() {
        let io_err = IoError::new(ErrorKind::PermissionDenied, "Permission denied");
        let app_err: AppError = io_err.into();
        assert!(matches!(app_err, AppError::Io(_)));

        let json_err: serde_json::Error =
            serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let app_err: AppError = json_err.into();
        assert!(matches!(app_err, AppError::Json(_)));

        let app_err: AppError = "channel closed".into();
        assert!(matches!(app_err, AppError::Internal(_)));
    }
}
