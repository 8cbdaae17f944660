//! JWKS management: signing-key rotation with "at most one active key per
//! alg" enforced both by `rotate_in`'s single transaction and by the
//! `idx_jwks_active_alg` partial unique index on the `jwks` table
//! (`[AMBIENT] §4.8`).
//!
//! Private key material is stored encrypted at rest (KEK-wrapped, see
//! `config::AppConfig::kek`); the public JWK is stored in the clear for
//! `/jwks` publication.

use crate::crypto::{aes256_gcm_unwrap, aes256_gcm_wrap};
use crate::store::{JwksAlg, JwksEntry, JwksRepo};
use anyhow::{Context, Result};
use chrono::Utc;
use rsa::pkcs1::{EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::rand_core::OsRng;
use rsa::RsaPrivateKey;

const RSA_KEY_BITS: usize = 2048;

/// Generates a fresh signing key for `alg`, rotates out any previously
/// active key for that alg, and persists the new one. Returns the new `kid`.
///
/// EdDSA keys are provisioned out-of-band (an Ed25519 PKCS8 DER blob handed
/// to `put_jwks_entry` directly); this function only knows how to mint
/// RS256 material, matching the teacher's existing `rsa` dependency.
pub fn rotate_signing_key(store: &dyn JwksRepo, kek: &[u8; 32], alg: JwksAlg) -> Result<String> {
    if alg != JwksAlg::RS256 {
        anyhow::bail!("rotate_signing_key only generates RS256 keys; provision EdDSA out-of-band");
    }

    let private_key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS).context("rsa keygen failed")?;
    let public_key = private_key.to_public_key();

    let kid = uuid::Uuid::new_v4().to_string();
    let public_jwk = rsa_public_jwk(&public_key, &kid)?;
    let private_der = private_key
        .to_pkcs1_der()
        .context("encode rsa private key")?
        .as_bytes()
        .to_vec();
    let private_jwk_encrypted = aes256_gcm_wrap(kek, kid.as_bytes(), &private_der)?;

    store.rotate_in(&JwksEntry {
        kid: kid.clone(),
        alg,
        public_jwk,
        private_jwk_encrypted,
        created_at: Utc::now(),
        rotated_at: None,
    })?;

    Ok(kid)
}

fn rsa_public_jwk(public_key: &rsa::RsaPublicKey, kid: &str) -> Result<String> {
    use rsa::traits::PublicKeyParts;
    let n = crate::crypto::b64url_encode(&public_key.n().to_bytes_be());
    let e = crate::crypto::b64url_encode(&public_key.e().to_bytes_be());
    Ok(serde_json::json!({
        "kty": "RSA",
        "use": "sig",
        "alg": "RS256",
        "kid": kid,
        "n": n,
        "e": e,
    })
    .to_string())
}

/// Decrypts the stored RS256 private key back into PKCS1 DER for
/// `jsonwebtoken::EncodingKey::from_rsa_der`.
pub fn decrypt_private_key_der(entry: &JwksEntry, kek: &[u8; 32]) -> Result<Vec<u8>> {
    aes256_gcm_unwrap(kek, entry.kid.as_bytes(), &entry.private_jwk_encrypted)
}

/// The discovery-document-facing JWK set: every key the store knows about,
/// public material only, regardless of rotation state (old keys stay
/// published for verification of not-yet-expired tokens).
pub fn public_jwks_document(store: &dyn JwksRepo) -> Result<serde_json::Value> {
    let keys: Vec<serde_json::Value> = store
        .list_all_public_keys()?
        .into_iter()
        .map(|entry| serde_json::from_str(&entry.public_jwk).unwrap_or(serde_json::Value::Null))
        .collect();
    Ok(serde_json::json!({ "keys": keys }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    #[test]
    fn rotation_leaves_exactly_one_active_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("d.sqlite3")).unwrap();
        let kek = [3u8; 32];

        let kid1 = rotate_signing_key(&store, &kek, JwksAlg::RS256).unwrap();
        let active1 = store.get_active_key(JwksAlg::RS256).unwrap().unwrap();
        assert_eq!(active1.kid, kid1);

        let kid2 = rotate_signing_key(&store, &kek, JwksAlg::RS256).unwrap();
        let active2 = store.get_active_key(JwksAlg::RS256).unwrap().unwrap();
        assert_eq!(active2.kid, kid2);
        assert_ne!(kid1, kid2);

        let all = store.get_all_verification_keys(JwksAlg::RS256).unwrap();
        assert_eq!(all.len(), 2);
    }

    /// The `idx_jwks_active_alg` partial unique index is the schema-level
    /// backstop for the invariant `rotate_in`'s transaction is meant to
    /// uphold: two non-rotated rows for the same alg must never coexist,
    /// even if something bypasses `rotate_in` entirely.
    #[test]
    fn schema_rejects_two_active_keys_for_same_alg() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("d.sqlite3")).unwrap();

        let entry = |kid: &str| JwksEntry {
            kid: kid.to_string(),
            alg: JwksAlg::RS256,
            public_jwk: "{}".to_string(),
            private_jwk_encrypted: vec![0u8; 12],
            created_at: Utc::now(),
            rotated_at: None,
        };

        store.put_jwks_entry(&entry("kid-a")).unwrap();
        let result = store.put_jwks_entry(&entry("kid-b"));
        assert!(result.is_err(), "a second active RS256 key must violate the partial unique index");
    }
}
