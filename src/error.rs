use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no route matched the request")]
    RouteNotFound,
    #[error("method not allowed")]
    MethodNotAllowed { allowed: Vec<String> },
    #[error("authentication required")]
    AuthenticationRequired,
    #[error("insufficient privileges")]
    Forbidden,
    #[error("rate limit exceeded")]
    RateLimitExceeded { retry_after_secs: u64 },
    #[error("circuit open for {service}")]
    CircuitOpen { service: String },
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("bad gateway: {0}")]
    BadGateway(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope<'a> {
    error: ErrorDetail<'a>,
    correlation_id: &'a str,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct ErrorDetail<'a> {
    code: &'static str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RouteNotFound => "ROUTE_NOT_FOUND",
            Self::MethodNotAllowed { .. } => "METHOD_NOT_ALLOWED",
            Self::AuthenticationRequired => "AUTHENTICATION_REQUIRED",
            Self::Forbidden => "FORBIDDEN",
            Self::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Timeout(_) => "TIMEOUT",
            Self::BadGateway(_) => "BAD_GATEWAY",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Client-facing message. Never carries backend addresses or raw transport errors.
    pub fn message(&self) -> String {
        match self {
            Self::RouteNotFound => "No route matched the request".to_string(),
            Self::MethodNotAllowed { .. } => "Method not allowed for this route".to_string(),
            Self::AuthenticationRequired => "A valid bearer token is required".to_string(),
            Self::Forbidden => "Insufficient privileges for this route".to_string(),
            Self::RateLimitExceeded { .. } => "Rate limit exceeded".to_string(),
            Self::CircuitOpen { .. } => "Service temporarily unavailable".to_string(),
            Self::ServiceUnavailable(_) => "Service unavailable".to_string(),
            Self::Timeout(_) => "Upstream service timed out".to_string(),
            Self::BadGateway(_) => "Upstream service returned an invalid response".to_string(),
            Self::InvalidRequest(msg) => msg.clone(),
            Self::Internal(_) => "Internal gateway error".to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::RouteNotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::AuthenticationRequired => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::MethodNotAllowed { allowed } => {
                Some(serde_json::json!({ "allowed_methods": allowed }))
            }
            Self::RateLimitExceeded { retry_after_secs } => {
                Some(serde_json::json!({ "retry_after_seconds": retry_after_secs }))
            }
            Self::CircuitOpen { service } => Some(serde_json::json!({ "service": service })),
            _ => None,
        }
    }

    pub fn into_envelope(self, correlation_id: &str) -> Response {
        let status = self.status();
        let message = self.message();
        let body = ErrorEnvelope {
            error: ErrorDetail {
                code: self.code(),
                message: &message,
                details: self.details(),
            },
            correlation_id,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        let mut response = (status, Json(body)).into_response();

        match &self {
            Self::RateLimitExceeded { retry_after_secs } => {
                if let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, v);
                }
            }
            Self::MethodNotAllowed { allowed } => {
                if let Ok(v) = HeaderValue::from_str(&allowed.join(", ")) {
                    response.headers_mut().insert(header::ALLOW, v);
                }
            }
            _ => {}
        }

        response
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() {
            Self::ServiceUnavailable(err.to_string())
        } else {
            Self::BadGateway(err.to_string())
        }
    }
}
