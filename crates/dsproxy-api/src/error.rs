//! Error types for the proxy pipeline

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for proxy operations
///
/// The response body carries only a generic reason; details stay in logs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing, malformed, expired, or unverifiable token
    #[error("authentication failed: {0}")]
    Unauthenticated(String),

    /// Token audience does not match the configured audience
    #[error("invalid audience")]
    InvalidAudience,

    /// No policy tuple authorizes the request
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Key set or policy not loaded yet, or no cluster client configured
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Malformed request
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Named object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Upstream request failed
    #[error("proxy error: {0}")]
    Proxy(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status for this error
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Unauthenticated(_) | Error::InvalidAudience => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Proxy(_) => StatusCode::BAD_GATEWAY,
            Error::Config(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Reason shown to the caller
    fn public_message(&self) -> String {
        match self {
            Error::Unauthenticated(_) => "unauthorized".to_string(),
            Error::InvalidAudience => "invalid audience".to_string(),
            Error::Forbidden(_) => "forbidden".to_string(),
            Error::ServiceUnavailable(_) => "service unavailable".to_string(),
            Error::BadRequest(msg) | Error::NotFound(msg) => msg.clone(),
            Error::Proxy(_) => "proxy error".to_string(),
            Error::Config(_) | Error::Internal(_) => "internal error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }

        let body = serde_json::json!({
            "status": "error",
            "code": status.as_u16(),
            "message": self.public_message(),
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        Error::Unauthenticated(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Proxy(e.to_string())
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        match &e {
            kube::Error::Api(resp) if resp.code == 404 => Error::NotFound(resp.message.clone()),
            _ => Error::Internal(e.to_string()),
        }
    }
}

impl From<dsproxy_policy::PolicyError> for Error {
    fn from(e: dsproxy_policy::PolicyError) -> Self {
        Error::Internal(e.to_string())
    }
}
