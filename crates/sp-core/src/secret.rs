//! Credentials sent to the device during login, privilege escalation and
//! secret changes.
//!
//! A [`Secret`] is automatically zeroed from memory when dropped using the
//! `zeroize` crate, and it never prints its contents through `Debug`.

use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

// ---------------------------------------------------------------------------
// Error Types
// ---------------------------------------------------------------------------

/// Errors that can occur while loading a secret.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    /// The named environment variable is not set.
    #[error("environment variable `{0}` is not set")]
    Missing(String),
    /// The named environment variable is set but empty or not valid unicode.
    #[error("environment variable `{0}` is empty or not valid unicode")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Secret
// ---------------------------------------------------------------------------

/// A password or passphrase that is zeroed from memory when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct Secret {
    value: String,
}

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    /// Read a secret from the environment variable `var`.
    pub fn from_env(var: &str) -> Result<Self, SecretError> {
        match std::env::var(var) {
            Ok(value) if !value.is_empty() => Ok(Self::new(value)),
            Ok(_) | Err(std::env::VarError::NotUnicode(_)) => {
                Err(SecretError::Invalid(var.to_string()))
            }
            Err(std::env::VarError::NotPresent) => Err(SecretError::Missing(var.to_string())),
        }
    }

    /// Like [`Secret::from_env`], but `None` when no variable name is given.
    pub fn from_optional_env(var: Option<&str>) -> Result<Option<Self>, SecretError> {
        var.map(Self::from_env).transpose()
    }

    /// Get the raw secret.
    ///
    /// # Security
    /// Use with caution - never log or format the returned string.
    pub fn expose(&self) -> &str {
        &self.value
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_does_not_leak() {
        let secret = Secret::new("hunter2");
        let printed = format!("{secret:?}");
        assert_eq!(printed, "Secret(***)");
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_expose_returns_value() {
        let secret = Secret::from("s3cret");
        assert_eq!(secret.expose(), "s3cret");
        assert!(!secret.is_empty());
    }

    #[test]
    fn test_zeroize_clears_value() {
        let mut secret = Secret::new("wipe-me");
        secret.zeroize();
        assert!(secret.is_empty());
    }

    #[test]
    fn test_from_env_missing() {
        let err = Secret::from_env("SP_CORE_TEST_SECRET_DEFINITELY_UNSET").unwrap_err();
        assert!(matches!(err, SecretError::Missing(_)));
    }

    #[test]
    fn test_from_optional_env_none() {
        assert!(Secret::from_optional_env(None).unwrap().is_none());
    }
}
