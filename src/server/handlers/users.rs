//! `GET /api/users` (spec §6): directory search for relying parties. Two
//! authentication paths — a bearer access token carrying the
//! `darkauth.users:read` scope, or HTTP Basic as a registered confidential
//! client — either is sufficient.

use crate::error::{DarkAuthError, Result};
use crate::oidc::Claims;
use crate::server::AppState;
use crate::store::JwksAlg;
use axum::extract::{Query, State};
use axum::http::{header, request::Parts};
use axum::Json;
use base64::Engine;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

const USERS_READ_SCOPE: &str = "darkauth.users:read";

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UserSummary {
    pub sub: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

fn bearer_scope_claims(state: &AppState, token: &str) -> Option<Claims> {
    let keys = state.store.get_all_verification_keys(JwksAlg::RS256).ok()?;
    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_issuer(&[&state.config.issuer]);
    validation.validate_aud = false;

    keys.iter().find_map(|entry| {
        let public: serde_json::Value = serde_json::from_str(&entry.public_jwk).ok()?;
        let n = public.get("n")?.as_str()?;
        let e = public.get("e")?.as_str()?;
        let key = DecodingKey::from_rsa_components(n, e).ok()?;
        decode::<Claims>(token, &key, &validation).ok().map(|d| d.claims)
    })
}

fn basic_auth_client_id(parts: &Parts, state: &AppState) -> Option<String> {
    let header = parts.headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (client_id, secret) = text.split_once(':')?;

    let client = state.store.get_client(client_id).ok()??;
    if client.client_type != crate::store::ClientType::Confidential {
        return None;
    }
    let encrypted = client.client_secret_encrypted.as_ref()?;
    let expected = crate::crypto::aes256_gcm_unwrap(&state.kek, client.client_id.as_bytes(), encrypted).ok()?;
    if crate::crypto::constant_time_eq(secret.as_bytes(), &expected) {
        Some(client_id.to_string())
    } else {
        None
    }
}

pub async fn search_users(
    State(state): State<AppState>,
    parts: Parts,
    Query(q): Query<SearchQuery>,
) -> Result<Json<Vec<UserSummary>>> {
    let bearer = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let authorized = bearer
        .and_then(|token| bearer_scope_claims(&state, token))
        .map(|claims| {
            claims
                .scope
                .as_deref()
                .map(|scope| scope.split(' ').any(|s| s == USERS_READ_SCOPE))
                .unwrap_or(false)
        })
        .unwrap_or(false)
        || basic_auth_client_id(&parts, &state).is_some();

    if !authorized {
        return Err(DarkAuthError::Unauthenticated);
    }

    let users = state
        .store
        .search_users(q.q.as_deref())
        .map_err(DarkAuthError::from)?
        .into_iter()
        .map(|u| UserSummary { sub: u.sub, email: u.email, name: u.name })
        .collect();

    Ok(Json(users))
}
