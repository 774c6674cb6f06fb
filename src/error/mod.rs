use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::response::timestamp;

/// Result type for API operations
pub type Result<T> = std::result::Result<T, ApiError>;

/// API error types
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Route not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    TooManyRequests(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to clients. Server-side failures are not described.
    pub fn public_message(&self) -> String {
        let status = self.status_code();
        if status.is_server_error() {
            status
                .canonical_reason()
                .unwrap_or("Internal Server Error")
                .to_string()
        } else {
            self.to_string()
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = Json(json!({
            "success": false,
            "error": {
                "statusCode": status.as_u16(),
                "message": self.public_message(),
            },
            "timestamp": timestamp(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            ApiError::NotFound("/nope".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::TooManyRequests("slow down".to_string()).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::Config("bad".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_display() {
        let err = ApiError::NotFound("/test".to_string());
        assert_eq!(err.to_string(), "Route not found: /test");

        let err = ApiError::TooManyRequests("Too many attempts".to_string());
        assert_eq!(err.to_string(), "Too many attempts");
    }

    #[test]
    fn test_public_message_hides_internal_detail() {
        let err = ApiError::Internal("connection string leaked".to_string());
        assert_eq!(err.public_message(), "Internal Server Error");

        let err = ApiError::TooManyRequests("Too many attempts".to_string());
        assert_eq!(err.public_message(), "Too many attempts");
    }

    #[tokio::test]
    async fn test_error_envelope() {
        let response = ApiError::TooManyRequests("slow down".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["statusCode"], 429);
        assert_eq!(json["error"]["message"], "slow down");
        assert!(json["timestamp"].is_string());
    }
}
