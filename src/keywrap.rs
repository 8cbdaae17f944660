//! Validation for the client-wrapped Data Root Key at the system boundary.
//!
//! The server never holds KW and never decrypts a wrapped DRK; it only
//! checks that whatever the client uploads has the right shape before
//! persisting it opaquely. See `crypto::WRAPPED_DRK_LEN` for the layout.

use crate::crypto::WRAPPED_DRK_LEN;
use crate::error::{DarkAuthError, Result};

/// Accepts or rejects a client-submitted wrapped DRK blob by shape alone:
/// exactly `iv(12) || tag(16) || ct(32)` bytes, nothing more, nothing less.
pub fn validate_wrapped_drk(bytes: &[u8]) -> Result<()> {
    if bytes.len() != WRAPPED_DRK_LEN {
        return Err(DarkAuthError::Validation(format!(
            "wrapped_drk must be exactly {WRAPPED_DRK_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_bytes;

    #[test]
    fn accepts_correct_length() {
        assert!(validate_wrapped_drk(&random_bytes(WRAPPED_DRK_LEN)).is_ok());
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(validate_wrapped_drk(&random_bytes(WRAPPED_DRK_LEN - 1)).is_err());
        assert!(validate_wrapped_drk(&random_bytes(WRAPPED_DRK_LEN + 1)).is_err());
    }
}
