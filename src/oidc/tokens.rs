//! ID/access token minting (spec §4.4), signed from the active JWKS key.

use crate::jwks;
use crate::store::{Client, JwksEntry};
use anyhow::{anyhow, Result};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub amr: Vec<String>,
    pub acr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zk_drk_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_use: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

fn signing_key_and_header(active_key: &JwksEntry, kek: &[u8; 32]) -> Result<(EncodingKey, Header)> {
    let der = jwks::decrypt_private_key_der(active_key, kek)?;
    let key = EncodingKey::from_rsa_der(&der);
    let mut header = Header::new(jsonwebtoken::Algorithm::RS256);
    header.kid = Some(active_key.kid.clone());
    Ok((key, header))
}

#[allow(clippy::too_many_arguments)]
pub fn mint_id_token(
    active_key: &JwksEntry,
    kek: &[u8; 32],
    issuer: &str,
    client: &Client,
    sub: &str,
    nonce: Option<String>,
    email: Option<String>,
    name: Option<String>,
    amr: Vec<String>,
    zk_drk_hash: Option<String>,
) -> Result<String> {
    let now = chrono::Utc::now().timestamp();
    let acr = if amr.contains(&"otp".to_string()) { "2" } else { "1" };
    let claims = Claims {
        iss: issuer.to_string(),
        sub: sub.to_string(),
        aud: client.client_id.clone(),
        iat: now,
        exp: now + client.id_token_lifetime_secs as i64,
        nonce,
        email,
        name,
        amr,
        acr: acr.to_string(),
        zk_drk_hash,
        token_use: None,
        scope: None,
    };
    let (key, header) = signing_key_and_header(active_key, kek)?;
    encode(&header, &claims, &key).map_err(|e| anyhow!("id token signing failed: {e}"))
}

pub fn mint_access_token(
    active_key: &JwksEntry,
    kek: &[u8; 32],
    issuer: &str,
    client: &Client,
    sub: &str,
    scope: &str,
) -> Result<String> {
    let now = chrono::Utc::now().timestamp();
    let claims = Claims {
        iss: issuer.to_string(),
        sub: sub.to_string(),
        aud: client.client_id.clone(),
        iat: now,
        exp: now + client.access_token_lifetime_secs as i64,
        nonce: None,
        email: None,
        name: None,
        amr: vec![],
        acr: "1".to_string(),
        zk_drk_hash: None,
        token_use: Some("access".to_string()),
        scope: Some(scope.to_string()),
    };
    let (key, header) = signing_key_and_header(active_key, kek)?;
    encode(&header, &claims, &key).map_err(|e| anyhow!("access token signing failed: {e}"))
}

/// `client_credentials` grant: access-token-only, `sub == aud == client_id`.
pub fn mint_client_credentials_token(
    active_key: &JwksEntry,
    kek: &[u8; 32],
    issuer: &str,
    client: &Client,
    scope: &str,
) -> Result<String> {
    mint_access_token(active_key, kek, issuer, client, &client.client_id, scope)
}
