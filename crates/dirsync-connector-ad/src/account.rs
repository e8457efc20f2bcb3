//! Account state and password encoding.
//!
//! The enabled state of an account lives in the `ACCOUNTDISABLE` bit of
//! `userAccountControl`. Passwords are written to `unicodePwd`, which Active
//! Directory only accepts over an encrypted channel and only in its own
//! encoding:
//! 1. Surround the password with double quotes: `"password"`
//! 2. Encode the quoted string as UTF-16LE bytes

use dirsync_connector::error::{ConnectorError, ConnectorResult};
use tracing::instrument;

/// `userAccountControl` flag: the account is disabled.
pub const ACCOUNTDISABLE: i64 = 0x2;
/// `userAccountControl` flag: no password is required.
pub const PASSWD_NOTREQD: i64 = 0x20;
/// `userAccountControl` flag: a default account type for a typical user.
pub const NORMAL_ACCOUNT: i64 = 0x200;

/// Attribute holding the account flags.
pub const USER_ACCOUNT_CONTROL: &str = "userAccountControl";
/// Write-only attribute holding the password.
pub const UNICODE_PWD: &str = "unicodePwd";

/// Quote and UTF-16LE encode a password without validating it.
pub fn quoted_utf16(password: &str) -> Vec<u8> {
    format!("\"{password}\"")
        .encode_utf16()
        .flat_map(u16::to_le_bytes)
        .collect()
}

/// Encode a plaintext password for the `unicodePwd` attribute.
///
/// # Errors
/// Returns a usage error if the password is empty.
#[instrument(skip(password))]
pub fn encode_password(password: &str) -> ConnectorResult<Vec<u8>> {
    if password.is_empty() {
        return Err(ConnectorError::usage("Password cannot be empty"));
    }
    Ok(quoted_utf16(password))
}

/// Fail unless the connection is encrypted, which password writes require.
pub fn require_secure_channel(use_ssl: bool) -> ConnectorResult<()> {
    if !use_ssl {
        return Err(ConnectorError::configuration(
            "SSL is required to set passwords; \
             Active Directory rejects unicodePwd over unencrypted connections",
        ));
    }
    Ok(())
}

/// Whether an account with these flags can log on.
pub fn is_enabled(uac: i64) -> bool {
    uac & ACCOUNTDISABLE == 0
}

/// Set or clear the disable bit, leaving every other flag untouched.
#[must_use]
pub fn with_enabled(uac: i64, enabled: bool) -> i64 {
    if enabled {
        uac & !ACCOUNTDISABLE
    } else {
        uac | ACCOUNTDISABLE
    }
}

/// Flags Active Directory gives a user created without explicit flags.
pub fn default_new_account_flags() -> i64 {
    NORMAL_ACCOUNT | PASSWD_NOTREQD | ACCOUNTDISABLE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_password_basic() {
        let encoded = encode_password("Test123!").unwrap();
        let expected: Vec<u8> = "\"Test123!\""
            .encode_utf16()
            .flat_map(u16::to_le_bytes)
            .collect();
        assert_eq!(encoded, expected);
        assert_eq!(&encoded[..2], &[0x22, 0x00]);
    }

    #[test]
    fn test_encode_password_length() {
        // "abc" plus quotes is five UTF-16 code units
        assert_eq!(encode_password("abc").unwrap().len(), 10);
        assert_eq!(encode_password("Pässwörd").unwrap().len() % 2, 0);
    }

    #[test]
    fn test_encode_password_empty_rejected() {
        let err = encode_password("").unwrap_err();
        assert!(err.to_string().contains("empty"));
        assert!(err.is_caller_error());
    }

    #[test]
    fn test_require_secure_channel() {
        assert!(require_secure_channel(true).is_ok());
        let err = require_secure_channel(false).unwrap_err();
        assert!(err.to_string().contains("SSL"));
    }

    #[test]
    fn test_enable_bit() {
        let disabled = default_new_account_flags();
        assert_eq!(disabled, 546);
        assert!(!is_enabled(disabled));

        let enabled = with_enabled(disabled, true);
        assert_eq!(enabled, 544);
        assert!(is_enabled(enabled));
        assert_eq!(with_enabled(enabled, false), 546);
        assert_eq!(with_enabled(0x10200, true), 0x10200);
    }
}
