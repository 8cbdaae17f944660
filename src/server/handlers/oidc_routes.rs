//! OIDC surface (spec §4.4, §6): discovery, JWKS, the authorize/finalize/token
//! triad, and userinfo. Handlers stay thin — query/body parsing and client
//! lookups here, grant semantics in `oidc::*`.

use crate::crypto::{b64url_encode, random_bytes, sha256};
use crate::error::{DarkAuthError, ErrorCode, Result};
use crate::jwks;
use crate::oidc::{self, AuthorizeParams};
use crate::server::session::{verify_csrf, UserSession};
use crate::server::AppState;
use crate::store::{Client, Cohort, GrantType, JwksAlg};
use axum::extract::{Query, State};
use axum::http::{header, request::Parts};
use axum::Json;
use axum_extra::extract::cookie::CookieJar;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

pub async fn discovery(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json((*state.discovery_document).clone())
}

pub async fn jwks_document(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    Ok(Json(jwks::public_jwks_document(state.store.as_ref()).map_err(DarkAuthError::from)?))
}

#[derive(Debug, Deserialize)]
pub struct AuthorizeQuery {
    pub client_id: String,
    pub redirect_uri: String,
    pub response_type: String,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub zk_pub: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AuthorizeResponse {
    pub request_id: String,
}

pub async fn authorize(
    State(state): State<AppState>,
    parts: Parts,
    Query(q): Query<AuthorizeQuery>,
) -> Result<Json<AuthorizeResponse>> {
    let client = state
        .store
        .get_client(&q.client_id)
        .map_err(DarkAuthError::from)?
        .ok_or_else(|| DarkAuthError::OAuth(ErrorCode::InvalidClient, "unknown client_id".into()))?;

    let origin = parts
        .headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok());

    let params = AuthorizeParams {
        client_id: &q.client_id,
        redirect_uri: &q.redirect_uri,
        response_type: &q.response_type,
        state: q.state.as_deref(),
        nonce: q.nonce.as_deref(),
        code_challenge: &q.code_challenge,
        code_challenge_method: &q.code_challenge_method,
        zk_pub: q.zk_pub.as_deref(),
        origin,
    };

    let pending = oidc::build_pending_auth(&client, &params)?;
    state.store.create_pending_auth(&pending).map_err(DarkAuthError::from)?;

    Ok(Json(AuthorizeResponse { request_id: pending.request_id }))
}

#[derive(Debug, Deserialize)]
pub struct FinalizeRequest {
    pub request_id: String,
    /// Present only for ZK clients; the fragment JWE the auth UI already
    /// assembled client-side. The server hashes it and echoes it back.
    pub drk_jwe: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FinalizeResponse {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zk_drk_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drk_jwe: Option<String>,
}

pub async fn finalize(
    State(state): State<AppState>,
    session: UserSession,
    parts: Parts,
    jar: CookieJar,
    Json(req): Json<FinalizeRequest>,
) -> Result<Json<FinalizeResponse>> {
    verify_csrf(&parts, &jar, Cohort::User)?;

    if session.0.otp_required() && !session.0.otp_verified() {
        return Err(DarkAuthError::Forbidden("otp_required".into()));
    }

    let mut pending = state
        .store
        .get_pending_auth(&req.request_id)
        .map_err(DarkAuthError::from)?
        .ok_or_else(|| DarkAuthError::OAuth(ErrorCode::InvalidRequest, "unknown or expired request_id".into()))?;
    if pending.expires_at < chrono::Utc::now() {
        state.store.delete_pending_auth(&req.request_id).map_err(DarkAuthError::from)?;
        return Err(DarkAuthError::OAuth(ErrorCode::InvalidRequest, "pending authorization expired".into()));
    }

    state
        .store
        .bind_pending_auth_user(&req.request_id, &session.0.subject_id)
        .map_err(DarkAuthError::from)?;
    pending.user_sub = Some(session.0.subject_id.clone());

    let mut amr = vec!["pwd".to_string()];
    if session.0.otp_verified() {
        amr.push("otp".to_string());
    }

    let auth_code = oidc::mint_auth_code(&pending, amr, req.drk_jwe.as_deref())?;
    state.store.create_auth_code(&auth_code).map_err(DarkAuthError::from)?;
    state.store.delete_pending_auth(&req.request_id).map_err(DarkAuthError::from)?;

    Ok(Json(FinalizeResponse {
        code: auth_code.code,
        zk_drk_hash: auth_code.drk_hash,
        drk_jwe: req.drk_jwe,
    }))
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub grant_type: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zk_drk_hash: Option<String>,
}

fn basic_auth_credentials(parts: &Parts) -> Option<(String, String)> {
    use base64::Engine;
    let header = parts.headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (id, secret) = text.split_once(':')?;
    Some((id.to_string(), secret.to_string()))
}

/// Authenticates a confidential client via HTTP Basic or body-supplied
/// `client_secret` (RFC 6749 §2.3.1), constant-time compared against the
/// KEK-unwrapped stored secret.
fn authenticate_confidential_client(
    client: &Client,
    kek: &[u8; 32],
    parts: &Parts,
    body_secret: Option<&str>,
) -> Result<()> {
    let provided = basic_auth_credentials(parts)
        .filter(|(id, _)| id == &client.client_id)
        .map(|(_, secret)| secret)
        .or_else(|| body_secret.map(|s| s.to_string()))
        .ok_or_else(|| DarkAuthError::OAuth(ErrorCode::InvalidClient, "client authentication required".into()))?;

    let encrypted = client
        .client_secret_encrypted
        .as_ref()
        .ok_or_else(|| DarkAuthError::OAuth(ErrorCode::InvalidClient, "client has no secret on file".into()))?;
    let expected = crate::crypto::aes256_gcm_unwrap(kek, client.client_id.as_bytes(), encrypted)
        .map_err(|_| DarkAuthError::OAuth(ErrorCode::InvalidClient, "client authentication failed".into()))?;

    if crate::crypto::constant_time_eq(provided.as_bytes(), &expected) {
        Ok(())
    } else {
        Err(DarkAuthError::OAuth(ErrorCode::InvalidClient, "client authentication failed".into()))
    }
}

pub async fn token(
    State(state): State<AppState>,
    parts: Parts,
    Json(req): Json<TokenRequest>,
) -> Result<Json<TokenResponse>> {
    match req.grant_type.as_str() {
        "authorization_code" => token_authorization_code(&state, &parts, &req).await,
        "refresh_token" => token_refresh(&state, &req).await,
        "client_credentials" => token_client_credentials(&state, &parts, &req).await,
        other => Err(DarkAuthError::OAuth(
            ErrorCode::UnsupportedGrantType,
            format!("unsupported grant_type: {other}"),
        )),
    }
}

async fn token_authorization_code(
    state: &AppState,
    parts: &Parts,
    req: &TokenRequest,
) -> Result<Json<TokenResponse>> {
    let basic = basic_auth_credentials(parts);
    let client_id = req
        .client_id
        .as_deref()
        .or(basic.as_ref().map(|(id, _)| id.as_str()))
        .ok_or_else(|| DarkAuthError::OAuth(ErrorCode::InvalidRequest, "client_id required".into()))?;
    let code = req
        .code
        .as_deref()
        .ok_or_else(|| DarkAuthError::OAuth(ErrorCode::InvalidRequest, "code required".into()))?;
    let redirect_uri = req
        .redirect_uri
        .as_deref()
        .ok_or_else(|| DarkAuthError::OAuth(ErrorCode::InvalidRequest, "redirect_uri required".into()))?;

    let client = state
        .store
        .get_client(client_id)
        .map_err(DarkAuthError::from)?
        .ok_or_else(|| DarkAuthError::OAuth(ErrorCode::InvalidClient, "unknown client_id".into()))?;
    oidc::require_grant_allowed(&client, GrantType::AuthorizationCode)?;
    if client.client_type == crate::store::ClientType::Confidential {
        authenticate_confidential_client(&client, &state.kek, parts, req.client_secret.as_deref())?;
    }

    let auth_code = state
        .store
        .get_auth_code(code)
        .map_err(DarkAuthError::from)?
        .ok_or_else(|| DarkAuthError::OAuth(ErrorCode::InvalidGrant, "unknown authorization code".into()))?;
    oidc::validate_auth_code_for_exchange(&auth_code, client_id, redirect_uri, req.code_verifier.as_deref())?;

    let won = state.store.consume_auth_code(code).map_err(DarkAuthError::from)?;
    if !won {
        return Err(DarkAuthError::OAuth(ErrorCode::InvalidGrant, "authorization code already consumed".into()));
    }

    let user = state
        .store
        .get_user_by_sub(&auth_code.user_sub)
        .map_err(DarkAuthError::from)?
        .ok_or_else(|| DarkAuthError::OAuth(ErrorCode::InvalidGrant, "user no longer exists".into()))?;

    let active_key = state
        .store
        .get_active_key(JwksAlg::RS256)
        .map_err(DarkAuthError::from)?
        .ok_or_else(|| DarkAuthError::Internal(anyhow::anyhow!("no active signing key")))?;

    let id_token = oidc::mint_id_token(
        &active_key,
        &state.kek,
        &state.config.issuer,
        &client,
        &user.sub,
        auth_code.nonce.clone(),
        user.email.clone(),
        user.name.clone(),
        auth_code.amr.clone(),
        auth_code.drk_hash.clone(),
    )
    .map_err(DarkAuthError::from)?;
    let access_token = oidc::mint_access_token(&active_key, &state.kek, &state.config.issuer, &client, &user.sub, "openid profile")
        .map_err(DarkAuthError::from)?;

    let refresh_token = if client.allowed_grant_types.contains(&GrantType::RefreshToken) {
        client.refresh_token_lifetime_secs.map(|ttl| -> Result<String> {
            let token = b64url_encode(&random_bytes(32));
            let hash = b64url_encode(&sha256(token.as_bytes()));
            state
                .store
                .create_session(
                    Cohort::User,
                    &user.sub,
                    serde_json::json!({ "oauth_client_id": client.client_id }),
                    ttl,
                    Some(&hash),
                    Some(ttl),
                )
                .map_err(DarkAuthError::from)?;
            Ok(token)
        }).transpose()?
    } else {
        None
    };

    Ok(Json(TokenResponse {
        access_token,
        token_type: "Bearer".to_string(),
        expires_in: client.access_token_lifetime_secs,
        id_token: Some(id_token),
        refresh_token,
        zk_drk_hash: auth_code.drk_hash,
    }))
}

async fn token_refresh(state: &AppState, req: &TokenRequest) -> Result<Json<TokenResponse>> {
    let refresh_token = req
        .refresh_token
        .as_deref()
        .ok_or_else(|| DarkAuthError::OAuth(ErrorCode::InvalidRequest, "refresh_token required".into()))?;
    let hash = b64url_encode(&sha256(refresh_token.as_bytes()));

    let session = state
        .store
        .get_session_by_refresh_hash(&hash)
        .map_err(DarkAuthError::from)?
        .ok_or_else(|| DarkAuthError::OAuth(ErrorCode::InvalidGrant, "unknown refresh token".into()))?;
    if session.refresh_token_consumed_at.is_some() {
        return Err(DarkAuthError::OAuth(ErrorCode::InvalidGrant, "refresh token already used".into()));
    }
    if session.refresh_token_expires_at.map(|exp| exp < chrono::Utc::now()).unwrap_or(true) {
        return Err(DarkAuthError::OAuth(ErrorCode::InvalidGrant, "refresh token expired".into()));
    }

    let won = state.store.consume_refresh_token(&session.id).map_err(DarkAuthError::from)?;
    if !won {
        return Err(DarkAuthError::OAuth(ErrorCode::InvalidGrant, "refresh token already used".into()));
    }
    state.store.delete_session(&session.id).map_err(DarkAuthError::from)?;

    let client_id = session
        .data
        .get("oauth_client_id")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| DarkAuthError::Internal(anyhow::anyhow!("refresh session missing oauth_client_id")))?;
    let client = state
        .store
        .get_client(client_id)
        .map_err(DarkAuthError::from)?
        .ok_or_else(|| DarkAuthError::OAuth(ErrorCode::InvalidClient, "unknown client_id".into()))?;

    let active_key = state
        .store
        .get_active_key(JwksAlg::RS256)
        .map_err(DarkAuthError::from)?
        .ok_or_else(|| DarkAuthError::Internal(anyhow::anyhow!("no active signing key")))?;
    let access_token = oidc::mint_access_token(&active_key, &state.kek, &state.config.issuer, &client, &session.subject_id, "openid profile")
        .map_err(DarkAuthError::from)?;

    let new_refresh_token = client.refresh_token_lifetime_secs.map(|ttl| -> Result<String> {
        let token = b64url_encode(&random_bytes(32));
        let new_hash = b64url_encode(&sha256(token.as_bytes()));
        state
            .store
            .create_session(
                Cohort::User,
                &session.subject_id,
                serde_json::json!({ "oauth_client_id": client.client_id }),
                ttl,
                Some(&new_hash),
                Some(ttl),
            )
            .map_err(DarkAuthError::from)?;
        Ok(token)
    }).transpose()?;

    Ok(Json(TokenResponse {
        access_token,
        token_type: "Bearer".to_string(),
        expires_in: client.access_token_lifetime_secs,
        id_token: None,
        refresh_token: new_refresh_token,
        zk_drk_hash: None,
    }))
}

async fn token_client_credentials(
    state: &AppState,
    parts: &Parts,
    req: &TokenRequest,
) -> Result<Json<TokenResponse>> {
    let basic = basic_auth_credentials(parts);
    let client_id = req
        .client_id
        .as_deref()
        .or(basic.as_ref().map(|(id, _)| id.as_str()))
        .ok_or_else(|| DarkAuthError::OAuth(ErrorCode::InvalidRequest, "client_id required".into()))?;

    let client = state
        .store
        .get_client(client_id)
        .map_err(DarkAuthError::from)?
        .ok_or_else(|| DarkAuthError::OAuth(ErrorCode::InvalidClient, "unknown client_id".into()))?;
    oidc::require_grant_allowed(&client, GrantType::ClientCredentials)?;
    authenticate_confidential_client(&client, &state.kek, parts, req.client_secret.as_deref())?;

    let active_key = state
        .store
        .get_active_key(JwksAlg::RS256)
        .map_err(DarkAuthError::from)?
        .ok_or_else(|| DarkAuthError::Internal(anyhow::anyhow!("no active signing key")))?;
    // The only scope client_credentials clients currently need is directory read
    // access; `/api/users` checks for exactly this value.
    let access_token = oidc::mint_client_credentials_token(
        &active_key,
        &state.kek,
        &state.config.issuer,
        &client,
        "darkauth.users:read",
    )
    .map_err(DarkAuthError::from)?;

    Ok(Json(TokenResponse {
        access_token,
        token_type: "Bearer".to_string(),
        expires_in: client.access_token_lifetime_secs,
        id_token: None,
        refresh_token: None,
        zk_drk_hash: None,
    }))
}

#[derive(Debug, Serialize)]
pub struct UserInfoResponse {
    pub sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

pub async fn userinfo(State(state): State<AppState>, parts: Parts) -> Result<Json<UserInfoResponse>> {
    let token = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(DarkAuthError::Unauthenticated)?;

    let candidates = state
        .store
        .get_all_verification_keys(JwksAlg::RS256)
        .map_err(DarkAuthError::from)?;

    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_issuer(&[&state.config.issuer]);
    validation.validate_aud = false;

    let claims = candidates
        .iter()
        .find_map(|entry| {
            let public: serde_json::Value = serde_json::from_str(&entry.public_jwk).ok()?;
            let n = public.get("n")?.as_str()?;
            let e = public.get("e")?.as_str()?;
            let key = DecodingKey::from_rsa_components(n, e).ok()?;
            decode::<oidc::Claims>(token, &key, &validation).ok()
        })
        .ok_or(DarkAuthError::Unauthenticated)?
        .claims;

    if claims.token_use.as_deref() != Some("access") {
        return Err(DarkAuthError::Unauthenticated);
    }

    let user = state
        .store
        .get_user_by_sub(&claims.sub)
        .map_err(DarkAuthError::from)?
        .ok_or(DarkAuthError::Unauthenticated)?;

    Ok(Json(UserInfoResponse { sub: user.sub, email: user.email, name: user.name }))
}
