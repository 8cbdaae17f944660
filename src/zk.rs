//! Zero-Knowledge DRK delivery (spec §4.5).
//!
//! The compact JWE (`alg=ECDH-ES`, `enc=A256GCM`) that carries the DRK to the
//! relying party is assembled client-side, in the browser, where the only key
//! material needed to unwrap the stored DRK (derived from `export_key`) ever
//! exists. The server's role is narrow: parse and fingerprint the relying
//! party's ephemeral P-256 public key at `/authorize`, and at `/finalize`
//! compute `zk_drk_hash` over whatever JWE string the client hands back so
//! the hash — never the JWE body — can be persisted on the auth code.

use crate::crypto::{b64url_decode, b64url_encode, sha256};
use crate::error::{DarkAuthError, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ZkPubJwk {
    kty: String,
    crv: String,
    x: String,
    y: String,
    #[serde(default)]
    d: Option<String>,
}

/// Parses and validates a client-supplied `zk_pub` (base64url(JSON JWK)),
/// returning its `zk_pub_kid` fingerprint. Rejects anything but a bare
/// public P-256 key: wrong `kty`/`crv`, malformed coordinates, or a private
/// `d` component are all errors.
pub fn parse_zk_pub(zk_pub: &str) -> Result<String> {
    let jwk_bytes = b64url_decode(zk_pub).map_err(|_| {
        DarkAuthError::Validation("zk_pub is not valid base64url".into())
    })?;
    let jwk_str = String::from_utf8(jwk_bytes)
        .map_err(|_| DarkAuthError::Validation("zk_pub is not valid UTF-8 JSON".into()))?;
    let jwk: ZkPubJwk = serde_json::from_str(&jwk_str)
        .map_err(|_| DarkAuthError::Validation("zk_pub is not a valid JWK".into()))?;

    if jwk.kty != "EC" || jwk.crv != "P-256" {
        return Err(DarkAuthError::Validation(
            "zk_pub must be kty=EC, crv=P-256".into(),
        ));
    }
    if jwk.d.is_some() {
        return Err(DarkAuthError::Validation(
            "zk_pub must not contain a private key component".into(),
        ));
    }
    let x = b64url_decode(&jwk.x).map_err(|_| DarkAuthError::Validation("zk_pub.x invalid".into()))?;
    let y = b64url_decode(&jwk.y).map_err(|_| DarkAuthError::Validation("zk_pub.y invalid".into()))?;
    if x.len() != 32 || y.len() != 32 {
        return Err(DarkAuthError::Validation(
            "zk_pub.x and zk_pub.y must each be 32 bytes".into(),
        ));
    }

    Ok(compute_zk_pub_kid(zk_pub))
}

/// `zk_pub_kid = base64url(SHA256(zk_pub_string))`, binding the exact
/// presentation the client sent rather than a re-serialization of it.
pub fn compute_zk_pub_kid(zk_pub: &str) -> String {
    b64url_encode(&sha256(zk_pub.as_bytes()))
}

/// `zk_drk_hash = base64url(SHA256(drk_jwe))`.
pub fn compute_zk_drk_hash(drk_jwe: &str) -> String {
    b64url_encode(&sha256(drk_jwe.as_bytes()))
}

/// Compact JWE serialization is five dot-separated base64url segments:
/// protected header, encrypted key, iv, ciphertext, tag. The server never
/// inspects the contents, only this shape, before treating the string as an
/// opaque blob to hash and forward.
pub fn validate_compact_jwe_shape(jwe: &str) -> Result<()> {
    let parts: Vec<&str> = jwe.split('.').collect();
    if parts.len() != 5 {
        return Err(DarkAuthError::Validation(
            "drk_jwe must be compact JWE serialization (5 segments)".into(),
        ));
    }
    if parts[0].is_empty() || parts[2].is_empty() || parts[4].is_empty() {
        return Err(DarkAuthError::Validation(
            "drk_jwe has an empty required segment".into(),
        ));
    }
    for part in &parts {
        if !part.is_empty() && b64url_decode(part).is_err() {
            return Err(DarkAuthError::Validation(
                "drk_jwe segment is not valid base64url".into(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::SigningKey;
    use p256::EncodedPoint;
    use rand_core::OsRng;

    fn sample_zk_pub() -> String {
        let sk = SigningKey::random(&mut OsRng);
        let point: EncodedPoint = sk.verifying_key().to_encoded_point(false);
        let x = b64url_encode(point.x().unwrap());
        let y = b64url_encode(point.y().unwrap());
        let jwk = serde_json::json!({"kty": "EC", "crv": "P-256", "x": x, "y": y});
        b64url_encode(jwk.to_string().as_bytes())
    }

    #[test]
    fn parses_valid_zk_pub() {
        let zk_pub = sample_zk_pub();
        let kid = parse_zk_pub(&zk_pub).unwrap();
        assert_eq!(kid, compute_zk_pub_kid(&zk_pub));
    }

    #[test]
    fn rejects_private_key_component() {
        let jwk = serde_json::json!({
            "kty": "EC", "crv": "P-256",
            "x": "A".repeat(43), "y": "A".repeat(43), "d": "A".repeat(43),
        });
        let zk_pub = b64url_encode(jwk.to_string().as_bytes());
        assert!(parse_zk_pub(&zk_pub).is_err());
    }

    #[test]
    fn drk_hash_matches_sha256() {
        let jwe = "hdr.key.iv.ct.tag";
        let hash = compute_zk_drk_hash(jwe);
        assert_eq!(hash, b64url_encode(&sha256(jwe.as_bytes())));
    }

    #[test]
    fn validates_compact_jwe_shape() {
        assert!(validate_compact_jwe_shape("aGVhZGVy.a2V5.aXY.Y3Q.dGFn").is_ok());
        assert!(validate_compact_jwe_shape("only.four.parts.here").is_err());
    }
}
