//! TOTP (RFC 6238) second factor (spec §4.6), via `totp-rs`.
//!
//! Secrets and backup codes are stored encrypted/hashed, never in the clear.
//! Lockout backs off geometrically on repeated failures, matching the
//! manager-wraps-store shape of the teacher's `user_manager.rs`.

use crate::crypto::{aes256_gcm_unwrap, aes256_gcm_wrap, random_bytes, sha256};
use crate::store::{Cohort, OtpConfig, OtpRepo};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use totp_rs::{Algorithm, Secret, TOTP};

const BACKUP_CODE_COUNT: usize = 10;
const LOCKOUT_BASE_SECS: i64 = 30;
const LOCKOUT_MAX_FAILURES_TRACKED: u32 = 10;
const STEP_SECS: u64 = 30;
const SKEW_STEPS: i64 = 1;

pub struct OtpEngine<'a> {
    store: &'a dyn OtpRepo,
    kek: [u8; 32],
}

impl<'a> OtpEngine<'a> {
    pub fn new(store: &'a dyn OtpRepo, kek: [u8; 32]) -> Self {
        Self { store, kek }
    }

    fn totp_for(&self, secret_bytes: &[u8]) -> Result<TOTP> {
        TOTP::new(
            Algorithm::SHA1,
            6,
            SKEW_STEPS as u8,
            STEP_SECS,
            Secret::Raw(secret_bytes.to_vec()).to_bytes().map_err(|e| anyhow!("{e:?}"))?,
        )
        .map_err(|e| anyhow!("totp construction failed: {e}"))
    }

    /// Begins enrollment: generates a secret, encrypts it at rest unverified,
    /// and returns the `otpauth://` URI for the authenticator app.
    pub fn setup_init(&self, cohort: Cohort, subject_id: &str, issuer: &str, account: &str) -> Result<String> {
        let secret_bytes = random_bytes(20);
        let totp = self.totp_for(&secret_bytes)?;
        let uri = totp.get_url_with_label_issuer(issuer, account)?;

        let secret_encrypted = aes256_gcm_wrap(&self.kek, subject_id.as_bytes(), &secret_bytes)?;
        self.store.put_otp_config(&OtpConfig {
            cohort,
            subject_id: subject_id.to_string(),
            secret_encrypted,
            verified: false,
            last_used_step: None,
            failure_count: 0,
            locked_until: None,
        })?;

        Ok(uri)
    }

    /// Completes enrollment (or performs an ordinary login-time check) by
    /// validating a 6-digit code. Enforces replay prevention via
    /// `last_used_step` and lockout via `locked_until`.
    pub fn verify(&self, cohort: Cohort, subject_id: &str, code: &str) -> Result<bool> {
        let config = self
            .store
            .get_otp_config(cohort, subject_id)?
            .context("otp not configured")?;

        if let Some(locked_until) = config.locked_until {
            if locked_until > Utc::now() {
                return Ok(false);
            }
        }

        let secret_bytes = aes256_gcm_unwrap(&self.kek, subject_id.as_bytes(), &config.secret_encrypted)?;
        let totp = self.totp_for(&secret_bytes)?;

        let now = Utc::now().timestamp() as u64;
        let current_step = (now / STEP_SECS) as i64;

        // `check_current` itself tolerates a `SKEW_STEPS`-wide window, so the
        // step that actually matched can be older than `current_step`; find
        // it directly rather than assuming a code matches only the wall-clock
        // step. A code whose matched step is no newer than `last_used_step`
        // is a replay, even if `current_step` has since ticked forward.
        let matched_step = (current_step - SKEW_STEPS..=current_step + SKEW_STEPS)
            .find(|step| step.is_positive() && totp.generate((*step as u64) * STEP_SECS) == code);

        let already_used = match (matched_step, config.last_used_step) {
            (Some(step), Some(last_used)) => step <= last_used,
            _ => false,
        };

        let valid = !already_used && matched_step.is_some();

        if valid {
            self.store.record_otp_success(cohort, subject_id, matched_step.unwrap())?;
        } else {
            let next_failures = config.failure_count.saturating_add(1).min(LOCKOUT_MAX_FAILURES_TRACKED);
            let locked_until = lockout_until(next_failures);
            self.store.record_otp_failure(cohort, subject_id, locked_until)?;
        }

        Ok(valid)
    }

    pub fn disable(&self, cohort: Cohort, subject_id: &str) -> Result<()> {
        self.store.delete_otp_config(cohort, subject_id)
    }

    /// Regenerates the full backup-code set, returning the plaintext codes
    /// exactly once; only their hashes are persisted.
    pub fn regenerate_backup_codes(&self, cohort: Cohort, subject_id: &str) -> Result<Vec<String>> {
        let mut plaintext_codes = Vec::with_capacity(BACKUP_CODE_COUNT);
        let mut hashes = Vec::with_capacity(BACKUP_CODE_COUNT);
        for _ in 0..BACKUP_CODE_COUNT {
            let code = format_backup_code(&random_bytes(5));
            hashes.push(crate::crypto::b64url_encode(&sha256(code.as_bytes())));
            plaintext_codes.push(code);
        }
        self.store.put_backup_codes(cohort, subject_id, &hashes)?;
        Ok(plaintext_codes)
    }

    pub fn verify_backup_code(&self, cohort: Cohort, subject_id: &str, code: &str) -> Result<bool> {
        let hash = crate::crypto::b64url_encode(&sha256(code.as_bytes()));
        self.store.consume_backup_code(cohort, subject_id, &hash)
    }
}

fn format_backup_code(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect::<String>()
}

/// Geometric backoff: `LOCKOUT_BASE_SECS * 2^(failures - 1)`, capped by
/// `LOCKOUT_MAX_FAILURES_TRACKED`. No lockout on the first failure.
fn lockout_until(failures: u32) -> Option<DateTime<Utc>> {
    if failures < 2 {
        return None;
    }
    let exponent = (failures - 2).min(16);
    let secs = LOCKOUT_BASE_SECS.saturating_mul(1i64 << exponent);
    Some(Utc::now() + Duration::seconds(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    #[test]
    fn setup_then_verify_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("d.sqlite3")).unwrap();
        let engine = OtpEngine::new(&store, [9u8; 32]);

        engine.setup_init(Cohort::User, "sub-1", "DarkAuth", "sub-1").unwrap();
        let config = store.get_otp_config(Cohort::User, "sub-1").unwrap().unwrap();
        let secret_bytes = aes256_gcm_unwrap(&[9u8; 32], b"sub-1", &config.secret_encrypted).unwrap();
        let totp = engine.totp_for(&secret_bytes).unwrap();
        let code = totp.generate_current().unwrap();

        assert!(engine.verify(Cohort::User, "sub-1", &code).unwrap());
        // replay of the same code within the same 30s step must fail
        assert!(!engine.verify(Cohort::User, "sub-1", &code).unwrap());
    }

    #[test]
    fn verify_rejects_code_from_last_used_step_after_clock_advances_one_tick() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("d.sqlite3")).unwrap();
        let engine = OtpEngine::new(&store, [9u8; 32]);

        engine.setup_init(Cohort::User, "sub-3", "DarkAuth", "sub-3").unwrap();
        let config = store.get_otp_config(Cohort::User, "sub-3").unwrap().unwrap();
        let secret_bytes = aes256_gcm_unwrap(&[9u8; 32], b"sub-3", &config.secret_encrypted).unwrap();
        let totp = engine.totp_for(&secret_bytes).unwrap();

        let now = Utc::now().timestamp() as u64;
        let current_step = (now / STEP_SECS) as i64;
        let previous_step = current_step - 1;
        let code = totp.generate((previous_step as u64) * STEP_SECS);

        // Simulate the code having already been accepted one tick ago: the
        // wall-clock step has moved on, but `check_current`'s skew=1 window
        // would still accept this same code.
        store.record_otp_success(Cohort::User, "sub-3", previous_step).unwrap();

        assert!(!engine.verify(Cohort::User, "sub-3", &code).unwrap());
    }

    #[test]
    fn lockout_backs_off_geometrically() {
        assert_eq!(lockout_until(1), None);
        let l2 = lockout_until(2).unwrap();
        let l3 = lockout_until(3).unwrap();
        assert!(l3 > l2);
    }

    #[test]
    fn backup_code_is_single_use() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("d.sqlite3")).unwrap();
        let engine = OtpEngine::new(&store, [9u8; 32]);
        let codes = engine.regenerate_backup_codes(Cohort::User, "sub-2").unwrap();
        let code = &codes[0];
        assert!(engine.verify_backup_code(Cohort::User, "sub-2", code).unwrap());
        assert!(!engine.verify_backup_code(Cohort::User, "sub-2", code).unwrap());
    }
}
