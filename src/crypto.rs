//! Crypto primitives: HKDF-SHA256, AES-256-GCM wrap/unwrap, SHA-256,
//! constant-time compare, base64url. Hand-wrapped narrow functions in the
//! same style as the upstream `pezzottify_argon2` module, rather than a
//! monolithic crypto-everything type.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, bail, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const DRK_LEN: usize = 32;
/// `iv(12) || tag(16) || ct(32)`
pub const WRAPPED_DRK_LEN: usize = IV_LEN + TAG_LEN + DRK_LEN;

pub fn b64url_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn b64url_decode(s: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|e| anyhow!("invalid base64url: {e}"))
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// HKDF-SHA256, matching the documented client-side key schedule:
/// `HKDF-SHA256(ikm, salt, info, L)`.
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], out_len: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = vec![0u8; out_len];
    hk.expand(info, &mut okm)
        .map_err(|e| anyhow!("hkdf expand failed: {e}"))?;
    Ok(okm)
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::rng().fill_bytes(&mut buf);
    buf
}

/// AES-256-GCM wrap: `iv(12) || tag(16) || ct`. The server calls this only to
/// validate the *shape* the client produced when reuploading a wrapped DRK
/// during tests; in production the server never has the key material to
/// build or open one of these (see `keywrap.rs`).
pub fn aes256_gcm_wrap(key: &[u8; 32], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("bad key: {e}"))?;
    let iv = random_bytes(IV_LEN);
    let nonce = Nonce::from_slice(&iv);
    let ct = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| anyhow!("gcm encrypt failed: {e}"))?;
    // `ct` from the `aes-gcm` crate is ciphertext||tag; rearrange to iv||tag||ct.
    if ct.len() < TAG_LEN {
        bail!("ciphertext shorter than tag");
    }
    let (body, tag) = ct.split_at(ct.len() - TAG_LEN);
    let mut out = Vec::with_capacity(IV_LEN + TAG_LEN + body.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(tag);
    out.extend_from_slice(body);
    Ok(out)
}

pub fn aes256_gcm_unwrap(key: &[u8; 32], aad: &[u8], wrapped: &[u8]) -> Result<Vec<u8>> {
    if wrapped.len() < IV_LEN + TAG_LEN {
        bail!("wrapped blob too short");
    }
    let (iv, rest) = wrapped.split_at(IV_LEN);
    let (tag, body) = rest.split_at(TAG_LEN);
    let mut ct_and_tag = Vec::with_capacity(body.len() + TAG_LEN);
    ct_and_tag.extend_from_slice(body);
    ct_and_tag.extend_from_slice(tag);

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("bad key: {e}"))?;
    let nonce = Nonce::from_slice(iv);
    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &ct_and_tag,
                aad,
            },
        )
        .map_err(|_| anyhow!("gcm decrypt failed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hkdf_is_deterministic() {
        let ikm = b"export-key-material-32-bytes!!!";
        let salt = sha256(b"DarkAuth|v1|tenant=t1|user=u1");
        let mk1 = hkdf_sha256(ikm, &salt, b"mk", 32).unwrap();
        let mk2 = hkdf_sha256(ikm, &salt, b"mk", 32).unwrap();
        assert_eq!(mk1, mk2);
        assert_eq!(mk1.len(), 32);
    }

    #[test]
    fn wrap_unwrap_roundtrip() {
        let key = [7u8; 32];
        let aad = b"user-sub-123";
        let drk = random_bytes(DRK_LEN);
        let wrapped = aes256_gcm_wrap(&key, aad, &drk).unwrap();
        assert_eq!(wrapped.len(), WRAPPED_DRK_LEN);
        let unwrapped = aes256_gcm_unwrap(&key, aad, &wrapped).unwrap();
        assert_eq!(unwrapped, drk);
    }

    #[test]
    fn unwrap_fails_with_wrong_aad() {
        let key = [7u8; 32];
        let drk = random_bytes(DRK_LEN);
        let wrapped = aes256_gcm_wrap(&key, b"sub-a", &drk).unwrap();
        assert!(aes256_gcm_unwrap(&key, b"sub-b", &wrapped).is_err());
    }

    #[test]
    fn constant_time_eq_detects_mismatch() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[test]
    fn b64url_roundtrip() {
        let bytes = random_bytes(32);
        let encoded = b64url_encode(&bytes);
        assert_eq!(b64url_decode(&encoded).unwrap(), bytes);
    }
}
