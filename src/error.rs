//! Request-time error type and its HTTP rendering.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// One failed attempt during endpoint probing
#[derive(Debug, Clone, Serialize)]
pub struct FailedAttempt {
    pub url: String,
    pub reason: String,
}

/// Errors surfaced to API callers
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Network failure or timeout talking to a third-party API.
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// The third-party API rejected our credentials.
    #[error("upstream rejected credentials ({service}), check the API token")]
    UpstreamAuth { service: String },

    /// The third-party API answered with a non-success status.
    #[error("upstream returned HTTP {status}: {message}")]
    UpstreamStatus { status: u16, message: String },

    /// The third-party API answered with something we cannot use.
    #[error("malformed upstream response: {0}")]
    MalformedResponse(String),

    /// Every candidate endpoint for an operation failed.
    #[error("all {} endpoints failed for {operation}", .attempts.len())]
    AllEndpointsFailed {
        operation: String,
        attempts: Vec<FailedAttempt>,
    },

    /// A required integration has no configuration.
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Stable machine-readable code for the error
    pub fn code(&self) -> &'static str {
        match self {
            Self::UpstreamUnreachable(_) => "upstream_unreachable",
            Self::UpstreamAuth { .. } => "upstream_auth",
            Self::UpstreamStatus { .. } => "upstream_status",
            Self::MalformedResponse(_) => "malformed_response",
            Self::AllEndpointsFailed { .. } => "all_endpoints_failed",
            Self::NotConfigured(_) => "not_configured",
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotFound(_) => "not_found",
            Self::Storage(_) => "storage",
            Self::Io(_) => "io",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::UpstreamUnreachable(_)
            | Self::UpstreamStatus { .. }
            | Self::MalformedResponse(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamAuth { .. } => StatusCode::UNAUTHORIZED,
            Self::AllEndpointsFailed { .. } | Self::NotConfigured(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Storage(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Classify a reqwest failure
    pub fn from_request(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::MalformedResponse(err.to_string())
        } else {
            Self::UpstreamUnreachable(err.to_string())
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("{}", self);
        }

        let mut body = serde_json::json!({
            "error": self.to_string(),
            "code": self.code(),
        });
        if let Self::AllEndpointsFailed { attempts, .. } = &self {
            body["attempts"] = serde_json::to_value(attempts).unwrap_or_default();
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_mentions_token() {
        let err = GatewayError::UpstreamAuth {
            service: "evolution api".to_string(),
        };
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert!(err.to_string().contains("check the API token"));
    }

    #[test]
    fn test_exhausted_endpoints_status() {
        let err = GatewayError::AllEndpointsFailed {
            operation: "fetch_contacts".to_string(),
            attempts: vec![FailedAttempt {
                url: "http://evo/instance/fetchContacts/x".to_string(),
                reason: "HTTP 404".to_string(),
            }],
        };
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.to_string(), "all 1 endpoints failed for fetch_contacts");
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
