//! OIDC authorization pipeline (spec §4.4): pending-auth lifecycle, PKCE,
//! auth-code minting/consumption, and the token endpoint's three grants.
//!
//! Route wiring and HTTP extraction live in `server::handlers`; this module
//! is the framework-free domain logic they call, the same split the teacher
//! keeps between `server/server.rs` (routes) and its manager modules.

mod discovery;
mod tokens;

pub use discovery::discovery_document;
pub use tokens::{mint_access_token, mint_client_credentials_token, mint_id_token, Claims};

use crate::crypto::{b64url_decode, b64url_encode, random_bytes, sha256};
use crate::error::{DarkAuthError, ErrorCode, Result};
use crate::store::{AuthCode, Client, GrantType, PendingAuth};
use crate::zk;
use chrono::{Duration, Utc};

const PENDING_AUTH_TTL_SECS: i64 = 600;
const AUTH_CODE_TTL_SECS: i64 = 60;
const AUTH_CODE_BYTES: usize = 32;

pub struct AuthorizeParams<'a> {
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    pub response_type: &'a str,
    pub state: Option<&'a str>,
    pub nonce: Option<&'a str>,
    pub code_challenge: &'a str,
    pub code_challenge_method: &'a str,
    pub zk_pub: Option<&'a str>,
    pub origin: Option<&'a str>,
}

/// Validates an `/authorize` request against its registered client and
/// builds the `PendingAuth` record to persist. Does not touch the store;
/// callers insert the returned record and hand back its `request_id`.
pub fn build_pending_auth(client: &Client, params: &AuthorizeParams) -> Result<PendingAuth> {
    if params.response_type != "code" {
        return Err(oauth_err(ErrorCode::InvalidRequest, "unsupported response_type"));
    }
    if !client.redirect_uris.iter().any(|u| u == params.redirect_uri) {
        return Err(oauth_err(ErrorCode::InvalidRequest, "redirect_uri not registered"));
    }
    if client.require_pkce && params.code_challenge_method != "S256" {
        return Err(oauth_err(ErrorCode::InvalidRequest, "code_challenge_method must be S256"));
    }

    let zk_pub_kid = match params.zk_pub {
        Some(zk_pub) => {
            let kid = zk::parse_zk_pub(zk_pub)?;
            if let Some(origin) = params.origin {
                if !client.allowed_zk_origins.iter().any(|o| o == origin) {
                    return Err(oauth_err(ErrorCode::AccessDenied, "origin not allowed for ZK delivery"));
                }
            } else {
                return Err(oauth_err(ErrorCode::InvalidRequest, "origin required for ZK delivery"));
            }
            Some(kid)
        }
        None => {
            if client.zk_required {
                return Err(oauth_err(ErrorCode::InvalidRequest, "zk_pub required by this client"));
            }
            None
        }
    };

    Ok(PendingAuth {
        request_id: uuid::Uuid::new_v4().to_string(),
        client_id: client.client_id.clone(),
        redirect_uri: params.redirect_uri.to_string(),
        state: params.state.map(|s| s.to_string()),
        nonce: params.nonce.map(|s| s.to_string()),
        code_challenge: params.code_challenge.to_string(),
        code_challenge_method: params.code_challenge_method.to_string(),
        zk_pub: params.zk_pub.map(|s| s.to_string()),
        zk_pub_kid,
        origin: params.origin.map(|s| s.to_string()),
        expires_at: Utc::now() + Duration::seconds(PENDING_AUTH_TTL_SECS),
        user_sub: None,
    })
}

/// Mints the auth code for a bound, authenticated `pending_auth` row. When
/// the client uses ZK delivery, `drk_jwe` is the compact JWE the browser
/// already assembled; only its hash is bound to the code.
pub fn mint_auth_code(
    pending: &PendingAuth,
    amr: Vec<String>,
    drk_jwe: Option<&str>,
) -> Result<AuthCode> {
    let user_sub = pending
        .user_sub
        .clone()
        .ok_or_else(|| oauth_err(ErrorCode::InvalidRequest, "pending_auth is not bound to a user"))?;

    let has_zk = pending.zk_pub_kid.is_some();
    let drk_hash = if has_zk {
        let jwe = drk_jwe.ok_or_else(|| oauth_err(ErrorCode::InvalidRequest, "drk_jwe required for ZK client"))?;
        zk::validate_compact_jwe_shape(jwe)?;
        Some(zk::compute_zk_drk_hash(jwe))
    } else {
        None
    };

    Ok(AuthCode {
        code: b64url_encode(&random_bytes(AUTH_CODE_BYTES)),
        client_id: pending.client_id.clone(),
        user_sub,
        redirect_uri: pending.redirect_uri.clone(),
        nonce: pending.nonce.clone(),
        code_challenge: Some(pending.code_challenge.clone()),
        code_challenge_method: Some(pending.code_challenge_method.clone()),
        expires_at: Utc::now() + Duration::seconds(AUTH_CODE_TTL_SECS),
        consumed: false,
        has_zk,
        zk_pub_kid: pending.zk_pub_kid.clone(),
        drk_hash,
        amr,
    })
}

/// Verifies PKCE S256: `base64url(SHA256(verifier)) == code_challenge`.
pub fn verify_pkce(code_verifier: &str, code_challenge: &str) -> bool {
    b64url_encode(&sha256(code_verifier.as_bytes())) == code_challenge
}

/// Validates a retrieved, not-yet-consumed `AuthCode` against the token
/// request's `client_id`/`redirect_uri`/PKCE verifier, without consuming it
/// — the caller performs the atomic compare-and-set consumption itself so
/// the race is resolved at the store layer (spec §5).
pub fn validate_auth_code_for_exchange(
    code: &AuthCode,
    client_id: &str,
    redirect_uri: &str,
    code_verifier: Option<&str>,
) -> Result<()> {
    if code.consumed {
        return Err(oauth_err(ErrorCode::InvalidGrant, "authorization code already consumed"));
    }
    if code.expires_at < Utc::now() {
        return Err(oauth_err(ErrorCode::InvalidGrant, "authorization code expired"));
    }
    if code.client_id != client_id {
        return Err(oauth_err(ErrorCode::InvalidGrant, "client_id mismatch"));
    }
    if code.redirect_uri != redirect_uri {
        return Err(oauth_err(ErrorCode::InvalidGrant, "redirect_uri mismatch"));
    }
    if let Some(challenge) = &code.code_challenge {
        let verifier = code_verifier.ok_or_else(|| oauth_err(ErrorCode::InvalidGrant, "code_verifier required"))?;
        if !verify_pkce(verifier, challenge) {
            return Err(oauth_err(ErrorCode::InvalidGrant, "PKCE verification failed"));
        }
    }
    Ok(())
}

/// Confirms a client is registered for a grant type and, for
/// `client_credentials`, that it is confidential.
pub fn require_grant_allowed(client: &Client, grant: GrantType) -> Result<()> {
    if !client.allowed_grant_types.contains(&grant) {
        return Err(oauth_err(ErrorCode::UnsupportedGrantType, "grant_type not allowed for this client"));
    }
    if grant == GrantType::ClientCredentials
        && client.client_type != crate::store::ClientType::Confidential
    {
        return Err(oauth_err(ErrorCode::InvalidClient, "client_credentials requires a confidential client"));
    }
    Ok(())
}

fn oauth_err(code: ErrorCode, message: &str) -> DarkAuthError {
    DarkAuthError::OAuth(code, message.to_string())
}

/// Decodes a `base64url(JSON JWK)` `zk_pub` parameter's raw form as supplied
/// on the wire, used by handlers that need the original string preserved for
/// hashing. Exposed here so handlers do not need to reach into `zk` directly
/// for this one conversion.
pub fn decode_zk_pub_string(zk_pub: &str) -> Result<String> {
    let bytes = b64url_decode(zk_pub).map_err(|_| oauth_err(ErrorCode::InvalidRequest, "invalid zk_pub encoding"))?;
    String::from_utf8(bytes).map_err(|_| oauth_err(ErrorCode::InvalidRequest, "zk_pub is not UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ClientType, TokenEndpointAuthMethod, ZkDelivery};

    fn sample_client() -> Client {
        Client {
            client_id: "demo-public-client".into(),
            client_type: ClientType::Public,
            token_endpoint_auth_method: TokenEndpointAuthMethod::None,
            client_secret_encrypted: None,
            require_pkce: true,
            zk_delivery: ZkDelivery::None,
            zk_required: false,
            allowed_jwe_algs: vec![],
            allowed_jwe_encs: vec![],
            redirect_uris: vec!["https://app.example.com/cb".into()],
            allowed_zk_origins: vec![],
            allowed_grant_types: vec![GrantType::AuthorizationCode, GrantType::RefreshToken],
            id_token_lifetime_secs: 300,
            access_token_lifetime_secs: 600,
            refresh_token_lifetime_secs: Some(3600),
        }
    }

    #[test]
    fn rejects_unregistered_redirect_uri() {
        let client = sample_client();
        let params = AuthorizeParams {
            client_id: &client.client_id,
            redirect_uri: "https://evil.example.com/cb",
            response_type: "code",
            state: None,
            nonce: None,
            code_challenge: "abc",
            code_challenge_method: "S256",
            zk_pub: None,
            origin: None,
        };
        assert!(build_pending_auth(&client, &params).is_err());
    }

    #[test]
    fn pkce_roundtrip() {
        let verifier = "abcdefghijklmnopqrstuvwxyz0123456789_-abcdefghij";
        let challenge = b64url_encode(&sha256(verifier.as_bytes()));
        assert!(verify_pkce(verifier, &challenge));
        assert!(!verify_pkce("wrong-verifier", &challenge));
    }

    #[test]
    fn auth_code_requires_bound_user() {
        let client = sample_client();
        let params = AuthorizeParams {
            client_id: &client.client_id,
            redirect_uri: "https://app.example.com/cb",
            response_type: "code",
            state: None,
            nonce: None,
            code_challenge: "abc",
            code_challenge_method: "S256",
            zk_pub: None,
            origin: None,
        };
        let pending = build_pending_auth(&client, &params).unwrap();
        assert!(mint_auth_code(&pending, vec!["pwd".into()], None).is_err());
    }
}
