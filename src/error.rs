//! Error taxonomy and the error responses handed back to clients

use crate::body::{full, GatewayBody};
use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE, WWW_AUTHENTICATE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Request-level failures. Each one is local to the request that hit it.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Credentials missing or not matching any user
    #[error("unauthorized")]
    Unauthorized,
    /// File missing or unreadable
    #[error("not found")]
    NotFound,
    /// Method other than GET/HEAD on a static path
    #[error("method not allowed")]
    MethodNotAllowed,
    /// Host header missing or malformed
    #[error("missing or invalid Host header")]
    MissingHost,
    /// Origin refused the connection or the exchange failed
    #[error("origin unreachable: {0}")]
    OriginUnreachable(String),
    /// Origin did not answer within the request timeout
    #[error("origin timed out after {0} seconds")]
    OriginTimeout(u64),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Error codes reported in the X-Gateway-Error header and JSON body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    Unauthorized,
    NotFound,
    MethodNotAllowed,
    MissingHostHeader,
    OriginUnreachable,
    OriginTimeout,
    InternalError,
}

impl GatewayErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayErrorCode::NotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            GatewayErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            GatewayErrorCode::OriginUnreachable => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::OriginTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::Unauthorized => "UNAUTHORIZED",
            GatewayErrorCode::NotFound => "NOT_FOUND",
            GatewayErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            GatewayErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            GatewayErrorCode::OriginUnreachable => "ORIGIN_UNREACHABLE",
            GatewayErrorCode::OriginTimeout => "ORIGIN_TIMEOUT",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl GatewayError {
    pub fn code(&self) -> GatewayErrorCode {
        match self {
            GatewayError::Unauthorized => GatewayErrorCode::Unauthorized,
            GatewayError::NotFound => GatewayErrorCode::NotFound,
            GatewayError::MethodNotAllowed => GatewayErrorCode::MethodNotAllowed,
            GatewayError::MissingHost => GatewayErrorCode::MissingHostHeader,
            GatewayError::OriginUnreachable(_) => GatewayErrorCode::OriginUnreachable,
            GatewayError::OriginTimeout(_) => GatewayErrorCode::OriginTimeout,
            GatewayError::Internal(_) => GatewayErrorCode::InternalError,
        }
    }

    /// Client-facing message. Origin and internal details stay in the logs.
    fn public_message(&self) -> String {
        match self {
            GatewayError::OriginUnreachable(_) => "Failed to connect to origin".to_string(),
            GatewayError::Internal(_) => "Internal error".to_string(),
            other => capitalize(&other.to_string()),
        }
    }

    pub fn into_response(self) -> Response<GatewayBody> {
        let mut response = json_error_response(self.code(), self.public_message());
        match self {
            GatewayError::Unauthorized => {
                response
                    .headers_mut()
                    .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Basic"));
            }
            GatewayError::MethodNotAllowed => {
                response
                    .headers_mut()
                    .insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
            }
            _ => {}
        }
        response
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: GatewayErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<GatewayBody> {
    let error = ErrorResponse::new(code, message);
    let mut response = Response::new(full(error.to_json()));
    *response.status_mut() = code.status_code();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert("x-gateway-error", HeaderValue::from_static(code.as_header_value()));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(GatewayErrorCode::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(GatewayErrorCode::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(GatewayErrorCode::OriginUnreachable.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(GatewayErrorCode::OriginTimeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(GatewayErrorCode::NotFound, "Not found");
        let json = error.to_json();
        assert!(json.contains("\"code\":\"NOT_FOUND\""));
        assert!(json.contains("\"message\":\"Not found\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_unauthorized_carries_basic_challenge() {
        let response = GatewayError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers().get(WWW_AUTHENTICATE).unwrap(), "Basic");
        assert_eq!(response.headers().get("x-gateway-error").unwrap(), "UNAUTHORIZED");
    }

    #[test]
    fn test_method_not_allowed_lists_methods() {
        let response = GatewayError::MethodNotAllowed.into_response();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers().get(ALLOW).unwrap(), "GET, HEAD");
    }

    #[test]
    fn test_origin_details_not_leaked() {
        let response =
            GatewayError::OriginUnreachable("connection refused 10.0.0.7:3000".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let error = GatewayError::OriginUnreachable("10.0.0.7".into());
        assert!(!error.public_message().contains("10.0.0.7"));
    }
}
