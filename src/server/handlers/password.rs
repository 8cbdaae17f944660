//! `/password/change/*` (spec §4.2, §6): OPAQUE re-registration against an
//! authenticated session, with reuse refusal keyed on a client-supplied
//! `export_key_hash` commitment. User cohort only — admins rotate via the
//! same `/admin/opaque/register/*` pair used for initial provisioning.

use crate::crypto::{b64url_decode, b64url_encode};
use crate::error::{DarkAuthError, Result};
use crate::server::session::{verify_csrf, UserSession};
use crate::server::AppState;
use crate::store::Cohort;
use axum::extract::State;
use axum::http::request::Parts;
use axum::Json;
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct PasswordChangeStartRequest {
    pub registration_request: String,
}

#[derive(Debug, Serialize)]
pub struct PasswordChangeStartResponse {
    pub registration_response: String,
}

#[derive(Debug, Deserialize)]
pub struct PasswordChangeFinishRequest {
    pub registration_upload: String,
    pub wrapped_drk: String,
    /// base64url(`SHA256(new export_key)`); rejected if seen before for this user.
    pub export_key_hash: String,
}

pub async fn password_change_start(
    State(state): State<AppState>,
    session: UserSession,
    Json(req): Json<PasswordChangeStartRequest>,
) -> Result<Json<PasswordChangeStartResponse>> {
    let email = session
        .0
        .data
        .get("email")
        .and_then(serde_json::Value::as_str)
        .ok_or(DarkAuthError::Internal(anyhow::anyhow!("session missing email")))?;

    let request_bytes = b64url_decode(&req.registration_request)
        .map_err(|_| DarkAuthError::Validation("registration_request is not valid base64url".into()))?;
    let response_bytes = state
        .opaque_engine
        .register_start(email, &request_bytes)
        .map_err(DarkAuthError::from)?;
    Ok(Json(PasswordChangeStartResponse {
        registration_response: b64url_encode(&response_bytes),
    }))
}

pub async fn password_change_finish(
    State(state): State<AppState>,
    session: UserSession,
    parts: Parts,
    jar: CookieJar,
    Json(req): Json<PasswordChangeFinishRequest>,
) -> Result<Json<serde_json::Value>> {
    verify_csrf(&parts, &jar, Cohort::User)?;

    let user_sub = session.0.subject_id.clone();
    let email = session
        .0
        .data
        .get("email")
        .and_then(serde_json::Value::as_str)
        .ok_or(DarkAuthError::Internal(anyhow::anyhow!("session missing email")))?
        .to_string();

    if state
        .store
        .export_key_hash_seen(&user_sub, &req.export_key_hash)
        .map_err(DarkAuthError::from)?
    {
        return Err(DarkAuthError::Conflict("password reuse not allowed".into()));
    }

    let upload_bytes = b64url_decode(&req.registration_upload)
        .map_err(|_| DarkAuthError::Validation("registration_upload is not valid base64url".into()))?;
    let wrapped_drk = b64url_decode(&req.wrapped_drk)
        .map_err(|_| DarkAuthError::Validation("wrapped_drk is not valid base64url".into()))?;
    crate::keywrap::validate_wrapped_drk(&wrapped_drk)?;

    state
        .opaque_engine
        .register_finish(state.store.as_ref(), &email, &upload_bytes)
        .map_err(DarkAuthError::from)?;
    state
        .store
        .put_wrapped_drk(&user_sub, &wrapped_drk)
        .map_err(DarkAuthError::from)?;
    state
        .store
        .record_export_key_hash(&user_sub, &req.export_key_hash)
        .map_err(DarkAuthError::from)?;
    state
        .store
        .set_password_reset_required(&user_sub, false)
        .map_err(DarkAuthError::from)?;

    Ok(Json(serde_json::json!({ "ok": true })))
}
