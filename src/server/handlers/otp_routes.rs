//! `/otp/*` and `/admin/otp/*` (spec §4.6, §6): TOTP enrollment, verification,
//! disable, and backup-code regeneration. Core logic is parameterized over
//! `(Cohort, subject_id)`; thin per-cohort handlers extract the session and
//! verify CSRF before delegating.

use crate::error::{DarkAuthError, Result};
use crate::otp::OtpEngine;
use crate::server::session::{verify_csrf, AdminSession, UserSession};
use crate::server::AppState;
use crate::store::Cohort;
use axum::extract::State;
use axum::http::request::Parts;
use axum::Json;
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct OtpSetupInitResponse {
    pub otp_auth_url: String,
}

#[derive(Debug, Deserialize)]
pub struct OtpCodeRequest {
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct OtpVerifyResponse {
    pub verified: bool,
}

#[derive(Debug, Serialize)]
pub struct OtpBackupCodesResponse {
    pub codes: Vec<String>,
}

fn setup_init_core(state: &AppState, cohort: Cohort, subject_id: &str, account: &str) -> Result<OtpSetupInitResponse> {
    let engine = OtpEngine::new(state.store.as_ref(), state.kek);
    let otp_auth_url = engine
        .setup_init(cohort, subject_id, &state.config.issuer, account)
        .map_err(DarkAuthError::from)?;
    Ok(OtpSetupInitResponse { otp_auth_url })
}

/// Shared verify path for both `/otp/setup/verify` and `/otp/verify`: a
/// successful check flips `OtpConfig::verified` at the store layer
/// (`record_otp_success`) and, when a session is active, patches
/// `otp_verified` into its data bag so downstream endpoints stop gating on
/// `otp_required() && !otp_verified()` (spec scenario 5).
fn verify_core(
    state: &AppState,
    cohort: Cohort,
    subject_id: &str,
    code: &str,
    session_id: Option<&str>,
    session_data: Option<serde_json::Value>,
) -> Result<bool> {
    let engine = OtpEngine::new(state.store.as_ref(), state.kek);
    let valid = engine.verify(cohort, subject_id, code).map_err(DarkAuthError::from)?;
    if valid {
        if let (Some(id), Some(mut data)) = (session_id, session_data) {
            data["otp_verified"] = serde_json::Value::Bool(true);
            state.store.patch_session_data(id, data).map_err(DarkAuthError::from)?;
        }
    }
    Ok(valid)
}

pub async fn otp_setup_init(State(state): State<AppState>, session: UserSession) -> Result<Json<OtpSetupInitResponse>> {
    let email = session.0.data.get("email").and_then(serde_json::Value::as_str).unwrap_or(&session.0.subject_id).to_string();
    Ok(Json(setup_init_core(&state, Cohort::User, &session.0.subject_id, &email)?))
}

pub async fn otp_setup_verify(
    State(state): State<AppState>,
    session: UserSession,
    parts: Parts,
    jar: CookieJar,
    Json(req): Json<OtpCodeRequest>,
) -> Result<Json<OtpVerifyResponse>> {
    verify_csrf(&parts, &jar, Cohort::User)?;
    let verified = verify_core(&state, Cohort::User, &session.0.subject_id, &req.code, Some(&session.0.id), Some(session.0.data.clone()))?;
    Ok(Json(OtpVerifyResponse { verified }))
}

pub async fn otp_verify(
    State(state): State<AppState>,
    session: UserSession,
    parts: Parts,
    jar: CookieJar,
    Json(req): Json<OtpCodeRequest>,
) -> Result<Json<OtpVerifyResponse>> {
    verify_csrf(&parts, &jar, Cohort::User)?;
    let verified = verify_core(&state, Cohort::User, &session.0.subject_id, &req.code, Some(&session.0.id), Some(session.0.data.clone()))?;
    if !verified {
        return Err(DarkAuthError::InvalidCredentials);
    }
    Ok(Json(OtpVerifyResponse { verified }))
}

pub async fn otp_disable(
    State(state): State<AppState>,
    session: UserSession,
    parts: Parts,
    jar: CookieJar,
) -> Result<Json<serde_json::Value>> {
    verify_csrf(&parts, &jar, Cohort::User)?;
    let engine = OtpEngine::new(state.store.as_ref(), state.kek);
    engine.disable(Cohort::User, &session.0.subject_id).map_err(DarkAuthError::from)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn otp_backup_regenerate(
    State(state): State<AppState>,
    session: UserSession,
    parts: Parts,
    jar: CookieJar,
) -> Result<Json<OtpBackupCodesResponse>> {
    verify_csrf(&parts, &jar, Cohort::User)?;
    let engine = OtpEngine::new(state.store.as_ref(), state.kek);
    let codes = engine.regenerate_backup_codes(Cohort::User, &session.0.subject_id).map_err(DarkAuthError::from)?;
    Ok(Json(OtpBackupCodesResponse { codes }))
}

pub async fn admin_otp_setup_init(State(state): State<AppState>, session: AdminSession) -> Result<Json<OtpSetupInitResponse>> {
    let email = session.0.data.get("email").and_then(serde_json::Value::as_str).unwrap_or(&session.0.subject_id).to_string();
    Ok(Json(setup_init_core(&state, Cohort::Admin, &session.0.subject_id, &email)?))
}

pub async fn admin_otp_verify(
    State(state): State<AppState>,
    session: AdminSession,
    parts: Parts,
    jar: CookieJar,
    Json(req): Json<OtpCodeRequest>,
) -> Result<Json<OtpVerifyResponse>> {
    verify_csrf(&parts, &jar, Cohort::Admin)?;
    let verified = verify_core(&state, Cohort::Admin, &session.0.subject_id, &req.code, Some(&session.0.id), Some(session.0.data.clone()))?;
    if !verified {
        return Err(DarkAuthError::InvalidCredentials);
    }
    Ok(Json(OtpVerifyResponse { verified }))
}

pub async fn admin_otp_disable(
    State(state): State<AppState>,
    session: AdminSession,
    parts: Parts,
    jar: CookieJar,
) -> Result<Json<serde_json::Value>> {
    verify_csrf(&parts, &jar, Cohort::Admin)?;
    let engine = OtpEngine::new(state.store.as_ref(), state.kek);
    engine.disable(Cohort::Admin, &session.0.subject_id).map_err(DarkAuthError::from)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn admin_otp_backup_regenerate(
    State(state): State<AppState>,
    session: AdminSession,
    parts: Parts,
    jar: CookieJar,
) -> Result<Json<OtpBackupCodesResponse>> {
    verify_csrf(&parts, &jar, Cohort::Admin)?;
    let engine = OtpEngine::new(state.store.as_ref(), state.kek);
    let codes = engine.regenerate_backup_codes(Cohort::Admin, &session.0.subject_id).map_err(DarkAuthError::from)?;
    Ok(Json(OtpBackupCodesResponse { codes }))
}
