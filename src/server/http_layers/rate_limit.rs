//! Rate limiting middleware using tower-governor (`[AMBIENT] §4.7`).
//!
//! Named per-minute/per-hour buckets per endpoint group, one `KeyExtractor`
//! per keying strategy, and a shared body-caching layer so a bucket that
//! keys on the request body (e.g. OPAQUE login by email) and the handler
//! that later parses that same body both see it. Structured the way the
//! teacher's `rate_limit.rs` is, generalized from user-id-or-IP keying to
//! subject-or-IP/email-or-IP keying for DarkAuth's cohorts.

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Request},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use tower_governor::{key_extractor::KeyExtractor, GovernorError};
use tracing::warn;

// ============================================================================
// Rate limit constants (per minute / per hour)
// ============================================================================

/// OPAQUE register/login attempts per minute per IP (brute-force guard).
pub const LOGIN_PER_MINUTE: u32 = 10;
pub const LOGIN_PER_HOUR: u32 = 100;

/// `/token` and `/authorize`+`/finalize` traffic per minute per subject-or-IP.
pub const TOKEN_PER_MINUTE: u32 = 30;
pub const TOKEN_PER_HOUR: u32 = 600;

/// OTP verification attempts per minute per subject-or-IP (guards against
/// TOTP/backup-code brute force).
pub const OTP_PER_MINUTE: u32 = 10;
pub const OTP_PER_HOUR: u32 = 100;

/// Everything else (userinfo, directory, crypto uploads) per minute per
/// subject-or-IP.
pub const GLOBAL_PER_MINUTE: u32 = 300;
pub const GLOBAL_PER_HOUR: u32 = 6000;

// ============================================================================
// Key extractors
// ============================================================================

#[derive(Clone)]
pub struct IpKeyExtractor;

impl KeyExtractor for IpKeyExtractor {
    type Key = SocketAddr;

    fn extract<T>(&self, req: &Request<T>) -> Result<Self::Key, GovernorError> {
        req.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr)
            .ok_or(GovernorError::UnableToExtractKey)
    }
}

/// Keys by the authenticated subject id (`user:<sub>` or `admin:<id>`) when a
/// session was resolved for this request by `extract_subject_for_rate_limit`;
/// falls back to IP for unauthenticated requests.
#[derive(Clone)]
pub struct SubjectOrIpKeyExtractor;

impl KeyExtractor for SubjectOrIpKeyExtractor {
    type Key = String;

    fn extract<T>(&self, req: &Request<T>) -> Result<Self::Key, GovernorError> {
        if let Some(subject) = req.extensions().get::<RateLimitSubject>() {
            return Ok(subject.0.clone());
        }
        if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
            return Ok(format!("ip:{}", addr.ip()));
        }
        Err(GovernorError::UnableToExtractKey)
    }
}

/// Keys by the `email` field of a cached JSON request body (OPAQUE
/// login/register, password change); falls back to IP when absent or
/// unparseable. Requires `cache_request_body` to run earlier in the stack.
#[derive(Clone)]
pub struct EmailKeyExtractor;

impl KeyExtractor for EmailKeyExtractor {
    type Key = String;

    fn extract<T>(&self, req: &Request<T>) -> Result<Self::Key, GovernorError> {
        if let Some(bytes) = req.extensions().get::<CachedBody>() {
            if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes.0) {
                if let Some(email) = value.get("email").and_then(serde_json::Value::as_str) {
                    return Ok(format!("email:{email}"));
                }
            }
        }
        if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
            return Ok(format!("ip:{}", addr.ip()));
        }
        Err(GovernorError::UnableToExtractKey)
    }
}

// ============================================================================
// Error handler
// ============================================================================

pub fn rate_limit_error_handler(err: GovernorError, req: Request<Body>) -> Response {
    match err {
        GovernorError::TooManyRequests { .. } => {
            let path = req.uri().path().to_string();
            let method = req.method().as_str().to_string();
            let identifier = if let Some(subject) = req.extensions().get::<RateLimitSubject>() {
                subject.0.clone()
            } else if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
                format!("ip:{}", addr.ip())
            } else {
                "unknown".to_string()
            };
            warn!("rate limit exceeded: {} {} {}", method, path, identifier);
            StatusCode::TOO_MANY_REQUESTS.into_response()
        }
        other => {
            warn!("rate limiting error: {:?}", other);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ============================================================================
// Body caching + subject extraction middleware
// ============================================================================

/// The whole request body, buffered once so a bucket's `KeyExtractor` and the
/// eventual handler can both read it (spec §4.7).
#[derive(Clone)]
pub struct CachedBody(pub Bytes);

#[derive(Clone)]
pub struct RateLimitSubject(pub String);

/// Buffers the request body into `CachedBody` and reinserts it so downstream
/// extractors (`Json<T>`, etc.) still see the full bytes.
pub async fn cache_request_body(request: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, 1024 * 1024)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    let mut request = Request::from_parts(parts, Body::from(bytes.clone()));
    request.extensions_mut().insert(CachedBody(bytes));
    Ok(next.run(request).await)
}

/// Resolves the caller's subject id (user or admin cohort) from the session
/// cookie/bearer token, without rejecting unauthenticated requests, and
/// stashes it for the rate-limit key extractors and error handler above.
pub async fn extract_subject_for_rate_limit(
    subject: crate::server::session::OptionalSubject,
    mut request: Request<Body>,
    next: Next,
) -> impl IntoResponse {
    if let Some(subject) = subject.0 {
        request.extensions_mut().insert(RateLimitSubject(subject));
    }
    next.run(request).await
}
