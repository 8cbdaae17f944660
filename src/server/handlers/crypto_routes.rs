//! `/crypto/*` (spec §4.2, §6): wrapped-DRK and encryption-public-JWK
//! storage. User cohort only — DarkAuth never holds an unwrapped DRK or a
//! user's private key material server-side.

use crate::crypto::b64url_encode;
use crate::error::{DarkAuthError, Result};
use crate::server::session::{verify_csrf, UserSession};
use crate::server::AppState;
use crate::store::Cohort;
use axum::extract::State;
use axum::http::request::Parts;
use axum::Json;
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};

/// Matches spec §6's size ceiling for the wrapped-DRK body; the wire format
/// itself is 60 bytes, this just bounds the decoded request generously.
const MAX_WRAPPED_DRK_BYTES: usize = 10 * 1024;

#[derive(Debug, Deserialize)]
pub struct PutWrappedDrkRequest {
    pub wrapped_drk: String,
}

#[derive(Debug, Serialize)]
pub struct WrappedDrkResponse {
    pub wrapped_drk: String,
}

pub async fn put_wrapped_drk(
    State(state): State<AppState>,
    session: UserSession,
    parts: Parts,
    jar: CookieJar,
    Json(req): Json<PutWrappedDrkRequest>,
) -> Result<Json<serde_json::Value>> {
    verify_csrf(&parts, &jar, Cohort::User)?;

    if req.wrapped_drk.len() > MAX_WRAPPED_DRK_BYTES {
        return Err(DarkAuthError::Validation("wrapped_drk exceeds size limit".into()));
    }
    let bytes = crate::crypto::b64url_decode(&req.wrapped_drk)
        .map_err(|_| DarkAuthError::Validation("wrapped_drk is not valid base64url".into()))?;
    crate::keywrap::validate_wrapped_drk(&bytes)?;

    state
        .store
        .put_wrapped_drk(&session.0.subject_id, &bytes)
        .map_err(DarkAuthError::from)?;

    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn get_wrapped_drk(State(state): State<AppState>, session: UserSession) -> Result<Json<WrappedDrkResponse>> {
    let record = state
        .store
        .get_wrapped_drk(&session.0.subject_id)
        .map_err(DarkAuthError::from)?
        .ok_or(DarkAuthError::NotFound)?;
    Ok(Json(WrappedDrkResponse { wrapped_drk: b64url_encode(&record.wrapped_drk) }))
}

#[derive(Debug, Deserialize)]
pub struct PutEncPublicJwkRequest {
    pub enc_public_jwk: String,
}

pub async fn put_enc_public_jwk(
    State(state): State<AppState>,
    session: UserSession,
    parts: Parts,
    jar: CookieJar,
    Json(req): Json<PutEncPublicJwkRequest>,
) -> Result<Json<serde_json::Value>> {
    verify_csrf(&parts, &jar, Cohort::User)?;

    if serde_json::from_str::<serde_json::Value>(&req.enc_public_jwk).is_err() {
        return Err(DarkAuthError::Validation("enc_public_jwk is not valid JSON".into()));
    }
    state
        .store
        .put_enc_public_jwk(&session.0.subject_id, &req.enc_public_jwk)
        .map_err(DarkAuthError::from)?;

    Ok(Json(serde_json::json!({ "ok": true })))
}
