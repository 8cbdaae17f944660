//! `/opaque/*` and `/admin/opaque/*` routes (spec §4.1, §6): OPAQUE
//! registration and login for both cohorts. Handlers stay thin — base64url
//! decode/encode at the wire boundary, domain logic in `opaque_engine`, same
//! split the teacher keeps between `server/server.rs` and its manager
//! modules.

use crate::crypto::{b64url_decode, b64url_encode};
use crate::error::{DarkAuthError, Result};
use crate::opaque_engine::AdminOpaqueRecords;
use crate::server::session::session_cookies;
use crate::server::AppState;
use crate::store::Cohort;
use axum::extract::State;
use axum::Json;
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct RegisterStartRequest {
    pub email: String,
    pub registration_request: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterStartResponse {
    pub registration_response: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterFinishRequest {
    pub email: String,
    pub registration_upload: String,
    /// base64url(`iv(12) || tag(16) || ct(32)`), the client's freshly wrapped DRK.
    pub wrapped_drk: String,
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterFinishResponse {
    pub sub: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginStartRequest {
    pub email: String,
    pub credential_request: String,
}

#[derive(Debug, Serialize)]
pub struct LoginStartResponse {
    pub login_session_id: String,
    pub credential_response: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginFinishRequest {
    pub login_session_id: String,
    pub credential_finalization: String,
}

#[derive(Debug, Serialize)]
pub struct LoginFinishResponse {
    pub otp_required: bool,
}

pub async fn register_start(
    State(state): State<AppState>,
    Json(req): Json<RegisterStartRequest>,
) -> Result<Json<RegisterStartResponse>> {
    if !state.config.self_registration_enabled {
        return Err(DarkAuthError::Forbidden("self-registration is disabled".into()));
    }
    let request_bytes = b64url_decode(&req.registration_request)
        .map_err(|_| DarkAuthError::Validation("registration_request is not valid base64url".into()))?;
    let response_bytes = state
        .opaque_engine
        .register_start(&req.email, &request_bytes)
        .map_err(DarkAuthError::from)?;
    Ok(Json(RegisterStartResponse {
        registration_response: b64url_encode(&response_bytes),
    }))
}

pub async fn register_finish(
    State(state): State<AppState>,
    Json(req): Json<RegisterFinishRequest>,
) -> Result<Json<RegisterFinishResponse>> {
    if !state.config.self_registration_enabled {
        return Err(DarkAuthError::Forbidden("self-registration is disabled".into()));
    }
    if state.store.get_user_by_email(&req.email).map_err(DarkAuthError::from)?.is_some() {
        return Err(DarkAuthError::Conflict("email already registered".into()));
    }

    let upload_bytes = b64url_decode(&req.registration_upload)
        .map_err(|_| DarkAuthError::Validation("registration_upload is not valid base64url".into()))?;
    let wrapped_drk = b64url_decode(&req.wrapped_drk)
        .map_err(|_| DarkAuthError::Validation("wrapped_drk is not valid base64url".into()))?;
    crate::keywrap::validate_wrapped_drk(&wrapped_drk)?;

    state
        .opaque_engine
        .register_finish(state.store.as_ref(), &req.email, &upload_bytes)
        .map_err(DarkAuthError::from)?;

    let sub = uuid::Uuid::new_v4().to_string();
    state
        .store
        .create_user(&sub, Some(&req.email), req.name.as_deref())
        .map_err(DarkAuthError::from)?;
    state
        .store
        .put_wrapped_drk(&sub, &wrapped_drk)
        .map_err(DarkAuthError::from)?;

    Ok(Json(RegisterFinishResponse { sub }))
}

pub async fn login_start(
    State(state): State<AppState>,
    Json(req): Json<LoginStartRequest>,
) -> Result<Json<LoginStartResponse>> {
    let request_bytes = b64url_decode(&req.credential_request)
        .map_err(|_| DarkAuthError::Validation("credential_request is not valid base64url".into()))?;
    let (login_session_id, response_bytes) = state
        .opaque_engine
        .login_start(state.store.as_ref(), Cohort::User, &req.email, &request_bytes)
        .map_err(|_| DarkAuthError::InvalidCredentials)?;
    Ok(Json(LoginStartResponse {
        login_session_id,
        credential_response: b64url_encode(&response_bytes),
    }))
}

pub async fn login_finish(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(req): Json<LoginFinishRequest>,
) -> Result<(CookieJar, Json<LoginFinishResponse>)> {
    let finalization_bytes = b64url_decode(&req.credential_finalization)
        .map_err(|_| DarkAuthError::Validation("credential_finalization is not valid base64url".into()))?;

    // login_start bound the login session to the email the client presented;
    // look it up again here only to resolve the user's stable `sub` once
    // the exchange succeeds — never before, so failure timing does not
    // depend on whether the email exists.
    let login_session = state
        .store
        .get_opaque_login_session(&req.login_session_id)
        .map_err(DarkAuthError::from)?
        .ok_or(DarkAuthError::InvalidCredentials)?;
    let email = String::from_utf8(login_session.identity_s.clone()).unwrap_or_default();

    state
        .opaque_engine
        .login_finish(state.store.as_ref(), &req.login_session_id, &finalization_bytes)
        .map_err(|_| DarkAuthError::InvalidCredentials)?;

    let user = state
        .store
        .get_user_by_email(&email)
        .map_err(DarkAuthError::from)?
        .ok_or(DarkAuthError::InvalidCredentials)?;

    let otp_required = state
        .store
        .get_otp_config(Cohort::User, &user.sub)
        .map_err(DarkAuthError::from)?
        .map(|c| c.verified)
        .unwrap_or(false);

    let data = serde_json::json!({
        "email": user.email,
        "name": user.name,
        "otp_required": otp_required,
        "otp_verified": false,
    });

    let refresh_token = b64url_encode(&crate::crypto::random_bytes(32));
    let refresh_hash = b64url_encode(&crate::crypto::sha256(refresh_token.as_bytes()));
    let session = state
        .store
        .create_session(
            Cohort::User,
            &user.sub,
            data,
            state.config.session.user_session_ttl_secs,
            Some(&refresh_hash),
            Some(state.config.session.refresh_token_ttl_secs),
        )
        .map_err(DarkAuthError::from)?;

    let csrf_token = b64url_encode(&crate::crypto::random_bytes(32));
    let jar = session_cookies(
        Cohort::User,
        &session.id,
        &csrf_token,
        Some(&refresh_token),
        state.config.session.user_session_ttl_secs,
        Some(state.config.session.refresh_token_ttl_secs),
    )
    .into_iter()
    .fold(jar, |jar, cookie| jar.add(cookie));

    Ok((jar, Json(LoginFinishResponse { otp_required })))
}

pub async fn admin_login_start(
    State(state): State<AppState>,
    Json(req): Json<LoginStartRequest>,
) -> Result<Json<LoginStartResponse>> {
    let request_bytes = b64url_decode(&req.credential_request)
        .map_err(|_| DarkAuthError::Validation("credential_request is not valid base64url".into()))?;
    let adapter = AdminOpaqueRecords(state.store.as_ref());
    let (login_session_id, response_bytes) = state
        .opaque_engine
        .login_start(&adapter, Cohort::Admin, &req.email, &request_bytes)
        .map_err(|_| DarkAuthError::InvalidCredentials)?;
    Ok(Json(LoginStartResponse {
        login_session_id,
        credential_response: b64url_encode(&response_bytes),
    }))
}

pub async fn admin_login_finish(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(req): Json<LoginFinishRequest>,
) -> Result<(CookieJar, Json<LoginFinishResponse>)> {
    let finalization_bytes = b64url_decode(&req.credential_finalization)
        .map_err(|_| DarkAuthError::Validation("credential_finalization is not valid base64url".into()))?;

    let login_session = state
        .store
        .get_opaque_login_session(&req.login_session_id)
        .map_err(DarkAuthError::from)?
        .ok_or(DarkAuthError::InvalidCredentials)?;
    let email = String::from_utf8(login_session.identity_s.clone()).unwrap_or_default();

    state
        .opaque_engine
        .login_finish(state.store.as_ref(), &req.login_session_id, &finalization_bytes)
        .map_err(|_| DarkAuthError::InvalidCredentials)?;

    let admin = state
        .store
        .get_admin_by_email(&email)
        .map_err(DarkAuthError::from)?
        .ok_or(DarkAuthError::InvalidCredentials)?;

    let otp_required = state
        .store
        .get_otp_config(Cohort::Admin, &admin.id)
        .map_err(DarkAuthError::from)?
        .map(|c| c.verified)
        .unwrap_or(false);

    let data = serde_json::json!({
        "email": admin.email,
        "name": admin.name,
        "role": admin.role.as_str(),
        "otp_required": otp_required,
        "otp_verified": false,
    });

    let refresh_token = b64url_encode(&crate::crypto::random_bytes(32));
    let refresh_hash = b64url_encode(&crate::crypto::sha256(refresh_token.as_bytes()));
    let session = state
        .store
        .create_session(
            Cohort::Admin,
            &admin.id,
            data,
            state.config.session.admin_session_ttl_secs,
            Some(&refresh_hash),
            Some(state.config.session.refresh_token_ttl_secs),
        )
        .map_err(DarkAuthError::from)?;

    let csrf_token = b64url_encode(&crate::crypto::random_bytes(32));
    let jar = session_cookies(
        Cohort::Admin,
        &session.id,
        &csrf_token,
        Some(&refresh_token),
        state.config.session.admin_session_ttl_secs,
        Some(state.config.session.refresh_token_ttl_secs),
    )
    .into_iter()
    .fold(jar, |jar, cookie| jar.add(cookie));

    Ok((jar, Json(LoginFinishResponse { otp_required })))
}

/// Admin credential provisioning, gated by `password_reset_required` rather
/// than `self_registration_enabled`: a directory admin creates the row via
/// administrative CRUD first, the named admin then sets their own OPAQUE
/// credential through this pair (Open Question decided in `DESIGN.md`).
pub async fn admin_register_start(
    State(state): State<AppState>,
    Json(req): Json<RegisterStartRequest>,
) -> Result<Json<RegisterStartResponse>> {
    let admin = state
        .store
        .get_admin_by_email(&req.email)
        .map_err(DarkAuthError::from)?
        .ok_or(DarkAuthError::NotFound)?;
    if !admin.password_reset_required {
        return Err(DarkAuthError::Conflict("admin credential already set".into()));
    }
    let request_bytes = b64url_decode(&req.registration_request)
        .map_err(|_| DarkAuthError::Validation("registration_request is not valid base64url".into()))?;
    let response_bytes = state
        .opaque_engine
        .register_start(&req.email, &request_bytes)
        .map_err(DarkAuthError::from)?;
    Ok(Json(RegisterStartResponse {
        registration_response: b64url_encode(&response_bytes),
    }))
}

pub async fn admin_register_finish(
    State(state): State<AppState>,
    Json(req): Json<RegisterFinishRequest>,
) -> Result<Json<RegisterFinishResponse>> {
    let admin = state
        .store
        .get_admin_by_email(&req.email)
        .map_err(DarkAuthError::from)?
        .ok_or(DarkAuthError::NotFound)?;
    if !admin.password_reset_required {
        return Err(DarkAuthError::Conflict("admin credential already set".into()));
    }
    let upload_bytes = b64url_decode(&req.registration_upload)
        .map_err(|_| DarkAuthError::Validation("registration_upload is not valid base64url".into()))?;

    let adapter = AdminOpaqueRecords(state.store.as_ref());
    state
        .opaque_engine
        .register_finish(&adapter, &req.email, &upload_bytes)
        .map_err(DarkAuthError::from)?;
    state
        .store
        .set_admin_password_reset_required(&admin.id, false)
        .map_err(DarkAuthError::from)?;

    Ok(Json(RegisterFinishResponse { sub: admin.id }))
}
