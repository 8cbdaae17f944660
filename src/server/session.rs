//! Cohort-scoped session extraction (`[AMBIENT] §4.3`): `FromRequestParts`
//! extractors for the user and admin cohorts, cookie-then-bearer fallback,
//! and the paired CSRF cookie check for state-changing endpoints. Grounded
//! in the teacher's `server/session.rs` (`FromRequestParts<ServerState>`,
//! cookie-then-header token extraction), generalized from a single cohort to
//! two so that cohort mismatch is rejected at extraction time rather than
//! deep in handler logic (spec P6).

use super::state::AppState;
use crate::crypto::constant_time_eq;
use crate::error::DarkAuthError;
use crate::store::{Cohort, Session as StoreSession};
use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::Utc;
use std::convert::Infallible;
use time::Duration as CookieDuration;

pub const USER_SESSION_COOKIE: &str = "__Host-DarkAuth";
pub const USER_CSRF_COOKIE: &str = "__Host-DarkAuth-CSRF";
pub const USER_REFRESH_COOKIE: &str = "__Host-DarkAuth-Refresh";
pub const ADMIN_SESSION_COOKIE: &str = "__Host-DarkAuth-Admin";
pub const ADMIN_CSRF_COOKIE: &str = "__Host-DarkAuth-Admin-CSRF";
pub const ADMIN_REFRESH_COOKIE: &str = "__Host-DarkAuth-Admin-Refresh";
pub const CSRF_HEADER: &str = "x-csrf-token";

fn session_cookie_name(cohort: Cohort) -> &'static str {
    match cohort {
        Cohort::User => USER_SESSION_COOKIE,
        Cohort::Admin => ADMIN_SESSION_COOKIE,
    }
}

fn csrf_cookie_name(cohort: Cohort) -> &'static str {
    match cohort {
        Cohort::User => USER_CSRF_COOKIE,
        Cohort::Admin => ADMIN_CSRF_COOKIE,
    }
}

fn refresh_cookie_name(cohort: Cohort) -> &'static str {
    match cohort {
        Cohort::User => USER_REFRESH_COOKIE,
        Cohort::Admin => ADMIN_REFRESH_COOKIE,
    }
}

async fn extract_token(parts: &mut Parts, state: &AppState, cohort: Cohort) -> Option<String> {
    let jar = CookieJar::from_request_parts(parts, state).await.ok()?;
    if let Some(cookie) = jar.get(session_cookie_name(cohort)) {
        return Some(cookie.value().to_string());
    }
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

async fn extract_session(
    parts: &mut Parts,
    state: &AppState,
    cohort: Cohort,
) -> Result<StoreSession, DarkAuthError> {
    let token = extract_token(parts, state, cohort)
        .await
        .ok_or(DarkAuthError::Unauthenticated)?;
    let session = state
        .store
        .get_session(&token)
        .map_err(DarkAuthError::from)?
        .ok_or(DarkAuthError::Unauthenticated)?;
    // Cohort isolation (P6): a session minted for the other cohort is
    // rejected here, never reaching handler logic.
    if session.cohort != cohort {
        return Err(DarkAuthError::Unauthenticated);
    }
    if session.expires_at < Utc::now() {
        return Err(DarkAuthError::Unauthenticated);
    }
    Ok(session)
}

/// An authenticated user-cohort session.
pub struct UserSession(pub StoreSession);

impl FromRequestParts<AppState> for UserSession {
    type Rejection = DarkAuthError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        Ok(UserSession(extract_session(parts, state, Cohort::User).await?))
    }
}

/// An authenticated admin-cohort session.
pub struct AdminSession(pub StoreSession);

impl FromRequestParts<AppState> for AdminSession {
    type Rejection = DarkAuthError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        Ok(AdminSession(extract_session(parts, state, Cohort::Admin).await?))
    }
}

/// Resolves whichever cohort's session is present without rejecting the
/// request; used only to stash a rate-limit key, never for authorization.
pub struct OptionalSubject(pub Option<String>);

impl FromRequestParts<AppState> for OptionalSubject {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if let Ok(session) = extract_session(parts, state, Cohort::User).await {
            return Ok(OptionalSubject(Some(format!("user:{}", session.subject_id))));
        }
        if let Ok(session) = extract_session(parts, state, Cohort::Admin).await {
            return Ok(OptionalSubject(Some(format!("admin:{}", session.subject_id))));
        }
        Ok(OptionalSubject(None))
    }
}

/// Verifies the `X-CSRF-Token` header against the cohort's browser-readable
/// CSRF cookie; required on every state-changing endpoint per spec §4.3.
pub fn verify_csrf(parts: &Parts, jar: &CookieJar, cohort: Cohort) -> Result<(), DarkAuthError> {
    let cookie_value = jar.get(csrf_cookie_name(cohort)).map(|c| c.value().to_string());
    let header_value = parts
        .headers
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    match (cookie_value, header_value) {
        (Some(c), Some(h)) if constant_time_eq(c.as_bytes(), h.as_bytes()) => Ok(()),
        _ => Err(DarkAuthError::Forbidden("csrf token mismatch".to_string())),
    }
}

fn host_cookie(name: &'static str, value: String, http_only: bool, max_age_secs: i64) -> Cookie<'static> {
    Cookie::build((name, value))
        .path("/")
        .secure(true)
        .http_only(http_only)
        .same_site(SameSite::Lax)
        .max_age(CookieDuration::seconds(max_age_secs))
        .build()
}

/// Builds the session + CSRF (+ optional refresh) cookies for a freshly
/// issued session, ready to attach to a `CookieJar` response.
pub fn session_cookies(
    cohort: Cohort,
    session_id: &str,
    csrf_token: &str,
    refresh_token: Option<&str>,
    session_ttl_secs: u64,
    refresh_ttl_secs: Option<u64>,
) -> Vec<Cookie<'static>> {
    let mut cookies = vec![
        host_cookie(session_cookie_name(cohort), session_id.to_string(), true, session_ttl_secs as i64),
        host_cookie(csrf_cookie_name(cohort), csrf_token.to_string(), false, session_ttl_secs as i64),
    ];
    if let (Some(refresh), Some(ttl)) = (refresh_token, refresh_ttl_secs) {
        cookies.push(host_cookie(refresh_cookie_name(cohort), refresh.to_string(), true, ttl as i64));
    }
    cookies
}

/// Expires every cookie for the cohort (logout / session invalidation).
pub fn clear_session_cookies(cohort: Cohort) -> Vec<Cookie<'static>> {
    vec![
        host_cookie(session_cookie_name(cohort), String::new(), true, 0),
        host_cookie(csrf_cookie_name(cohort), String::new(), false, 0),
        host_cookie(refresh_cookie_name(cohort), String::new(), true, 0),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_names_are_host_prefixed_and_cohort_distinct() {
        assert_ne!(session_cookie_name(Cohort::User), session_cookie_name(Cohort::Admin));
        assert!(session_cookie_name(Cohort::User).starts_with("__Host-"));
        assert!(csrf_cookie_name(Cohort::Admin).starts_with("__Host-"));
    }
}
