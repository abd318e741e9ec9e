//! Credential wrapper with memory zeroization.
//!
//! Tokens handed to connectors (ARM bearer tokens, document-store Entra ID
//! tokens, OAuth2 client secrets) are held in a `SecureString`. The contents
//! are wiped when dropped and never appear in `Debug`/`Display` output or in
//! serialized configuration.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::Zeroizing;

/// Marker written in place of a secret wherever it would otherwise be shown.
pub const REDACTED: &str = "***REDACTED***";

/// A string whose memory is zeroized on drop.
#[derive(Clone, Default)]
pub struct SecureString(Zeroizing<String>);

impl SecureString {
    /// Wraps a secret.
    pub fn new(s: String) -> Self {
        Self(Zeroizing::new(s))
    }

    /// Exposes the secret for use in a request header.
    ///
    /// Copies of the returned slice are not zeroized.
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    /// Returns true if no secret is set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for SecureString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SecureString {
    fn from(s: &str) -> Self {
        Self::new(s.to_string())
    }
}

impl fmt::Debug for SecureString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureString({})", REDACTED)
    }
}

impl fmt::Display for SecureString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl Serialize for SecureString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(REDACTED)
    }
}

impl<'de> Deserialize<'de> for SecureString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(SecureString::new)
    }
}
