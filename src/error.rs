//! Unified error type for the gateway
//!
//! Every fallible path in the crate — config validation, resolution,
//! process spawn/readiness, forwarding — returns `GatewayError`. The HTTP
//! boundary is the only place that maps a `GatewayError` to a status code
//! and response body; nothing upstream of that needs to know about HTTP.

use axum::{
    body::Body,
    http::{header, HeaderMap, Response, StatusCode},
    response::IntoResponse,
};
use serde::Serialize;
use thiserror::Error;

/// The single error type returned by every fallible operation in this crate.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("timeout: {message}")]
    Timeout { message: String },

    #[error("spawn failed: {message}")]
    SpawnFailed {
        message: String,
        #[source]
        cause: Option<anyhow::Error>,
    },

    #[error("upstream error: {message}")]
    UpstreamError {
        message: String,
        #[source]
        cause: Option<anyhow::Error>,
    },

    #[error("canceled")]
    Canceled,

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    /// Stable machine-readable code, independent of the human message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Unauthorized => "unauthorized",
            Self::NotFound { .. } => "not_found",
            Self::Timeout { .. } => "timeout",
            Self::SpawnFailed { .. } => "spawn_failed",
            Self::UpstreamError { .. } => "upstream_error",
            Self::Canceled => "canceled",
            Self::Internal { .. } => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::SpawnFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::UpstreamError { .. } => StatusCode::BAD_GATEWAY,
            Self::Canceled => StatusCode::from_u16(499).unwrap(),
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    pub fn spawn_failed(message: impl Into<String>, cause: Option<anyhow::Error>) -> Self {
        Self::SpawnFailed {
            message: message.into(),
            cause,
        }
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::UpstreamError {
            message: message.into(),
            cause: None,
        }
    }

    pub fn upstream_with_cause(message: impl Into<String>, cause: anyhow::Error) -> Self {
        Self::UpstreamError {
            message: message.into(),
            cause: Some(cause),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Structured body returned on error when the client accepts JSON.
#[derive(Serialize)]
struct ErrorBody<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    code: &'static str,
    message: &'a str,
}

/// True if the request's `Accept` header prefers JSON over plain text.
///
/// Mirrors the teacher's habit of reading a single header field directly
/// (`proxy/helpers.rs`) rather than pulling in a content-negotiation crate.
fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("application/json") || accept.contains("*/*"))
        .unwrap_or(true)
}

impl GatewayError {
    /// Render this error against the request headers that produced it, so
    /// the body can be content-negotiated. `IntoResponse` alone can't see
    /// the request, so handlers that care about negotiation call this
    /// directly instead of relying on `?` + the blanket `IntoResponse` impl.
    pub fn into_response_for(self, headers: &HeaderMap) -> Response<Body> {
        let status = self.status();
        let message = self.to_string();

        if matches!(self, Self::Canceled) {
            // Client already went away; nothing meaningful to send back.
            return Response::builder()
                .status(status)
                .body(Body::empty())
                .unwrap();
        }

        if wants_json(headers) {
            let body = ErrorBody {
                kind: self.code(),
                code: self.code(),
                message: &message,
            };
            let json = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());
            let mut builder = Response::builder()
                .status(status)
                .header(header::CONTENT_TYPE, "application/json");
            if status == StatusCode::UNAUTHORIZED {
                builder = builder.header(header::WWW_AUTHENTICATE, "Basic realm=\"modelrelay\"");
            }
            builder.body(Body::from(json)).unwrap()
        } else {
            let mut builder = Response::builder()
                .status(status)
                .header(header::CONTENT_TYPE, "text/plain; charset=utf-8");
            if status == StatusCode::UNAUTHORIZED {
                builder = builder.header(header::WWW_AUTHENTICATE, "Basic realm=\"modelrelay\"");
            }
            builder.body(Body::from(message)).unwrap()
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response<Body> {
        tracing::error!(code = self.code(), "{}", self);
        self.into_response_for(&HeaderMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_spec() {
        assert_eq!(
            GatewayError::invalid_request("bad").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(GatewayError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            GatewayError::not_found("x").status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(GatewayError::upstream("x").status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            GatewayError::Internal {
                message: "x".into()
            }
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn json_body_shape() {
        let headers = HeaderMap::new();
        let resp = GatewayError::not_found("no such model").into_response_for(&headers);
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn plain_text_when_accept_excludes_json() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, "text/plain".parse().unwrap());
        let resp = GatewayError::invalid_request("bad body").into_response_for(&headers);
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.starts_with("text/plain"));
    }
}
