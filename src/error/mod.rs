use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Gateway error types
///
/// An authorization denial is not represented here: a non-200 probe is
/// returned to the caller as an ordinary response.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid upstream: {0}")]
    InvalidUpstream(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Request body too large: {0}")]
    PayloadTooLarge(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl GatewayError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::InvalidUpstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Proxy(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Backend(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Http(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Whether the error came from talking to the upstream host
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            GatewayError::Proxy(_) | GatewayError::Backend(_) | GatewayError::Timeout(_)
        )
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
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
            GatewayError::Backend("connection refused".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::Timeout("probe".to_string()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::PayloadTooLarge("11MB".to_string()).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn test_error_display() {
        let err = GatewayError::InvalidUpstream("ftp://nope".to_string());
        assert_eq!(err.to_string(), "Invalid upstream: ftp://nope");
    }

    #[test]
    fn test_is_transport() {
        assert!(GatewayError::Proxy("x".to_string()).is_transport());
        assert!(GatewayError::Timeout("x".to_string()).is_transport());
        assert!(!GatewayError::Config("x".to_string()).is_transport());
    }

    #[tokio::test]
    async fn test_into_response_body() {
        let response = GatewayError::Backend("refused".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], 502);
        assert_eq!(value["error"], "Backend error: refused");
    }
}
