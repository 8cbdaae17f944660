//! Single tagged error enum at the domain boundary.
//!
//! Store and engine code returns `anyhow::Result` internally, matching the
//! rest of the codebase's idiom. `DarkAuthError` exists only at the edge
//! where a handler turns a domain failure into an HTTP response; conversion
//! happens in exactly one place (`IntoResponse` below), per the design note
//! that error-as-value and HTTP mapping should not be interleaved.

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    Unauthenticated,
    Forbidden,
    NotFound,
    Conflict,
    RateLimited,
    Internal,
    InvalidRequest,
    InvalidGrant,
    InvalidClient,
    UnsupportedGrantType,
    AccessDenied,
}

impl ErrorCode {
    fn status(self) -> StatusCode {
        match self {
            ErrorCode::Validation
            | ErrorCode::InvalidRequest
            | ErrorCode::InvalidGrant
            | ErrorCode::InvalidClient
            | ErrorCode::UnsupportedGrantType => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden | ErrorCode::AccessDenied => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DarkAuthError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited")]
    RateLimited,

    /// Collapsed OPAQUE/credential failure. Never reveals which step failed.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Standard OAuth/OIDC error codes, surfaced with the RFC 6749 `error` value.
    #[error("oauth error: {0}")]
    OAuth(ErrorCode, String),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl DarkAuthError {
    fn code(&self) -> ErrorCode {
        match self {
            DarkAuthError::Validation(_) => ErrorCode::Validation,
            DarkAuthError::Unauthenticated | DarkAuthError::InvalidCredentials => {
                ErrorCode::Unauthenticated
            }
            DarkAuthError::Forbidden(_) => ErrorCode::Forbidden,
            DarkAuthError::NotFound => ErrorCode::NotFound,
            DarkAuthError::Conflict(_) => ErrorCode::Conflict,
            DarkAuthError::RateLimited => ErrorCode::RateLimited,
            DarkAuthError::OAuth(code, _) => *code,
            DarkAuthError::Internal(_) => ErrorCode::Internal,
        }
    }
}

impl IntoResponse for DarkAuthError {
    fn into_response(self) -> Response {
        if let DarkAuthError::Internal(ref err) = self {
            tracing::error!(error = %err, "internal error");
        }
        let code = self.code();
        let message = match &self {
            DarkAuthError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        let body = json!({
            "error": message,
            "code": code,
        });
        (code.status(), Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, DarkAuthError>;
