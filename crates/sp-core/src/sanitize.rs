//! Redaction of command lines before they are logged.

use std::borrow::Cow;

/// Replacement text for anything that looks like it carries a credential.
pub const REDACTED: &str = "[REDACTED]";

/// Lowercase fragments that mark a command line as sensitive.
const SENSITIVE_PATTERNS: &[&str] = &[
    "password",
    "pre-shared-key",
    "secret",
    "community",
    "token",
    "key",
    "credential",
];

/// Whether `text` contains any sensitive fragment (case-insensitive).
pub fn is_sensitive(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }
    let lower = text.to_ascii_lowercase();
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Returns the command unchanged, or [`REDACTED`] when it looks sensitive.
pub fn sanitize_command(command: &str) -> Cow<'_, str> {
    if is_sensitive(command) {
        Cow::Borrowed(REDACTED)
    } else {
        Cow::Borrowed(command)
    }
}
