//! Credential key derivation and parsing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha224};

use crate::error::KeyError;

/// Width of a credential key on the wire: hex-encoded SHA-224 (28 bytes).
pub const KEY_LEN: usize = 56;

/// A credential key: the hex SHA-224 digest of a password.
///
/// Stored as the exact ASCII bytes a client puts on the wire, so a key can
/// be compared against a connection prefix without decoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CredentialKey([u8; KEY_LEN]);

impl CredentialKey {
    /// Derive the key for a password.
    pub fn derive(password: &str) -> Self {
        let digest = Sha224::digest(password.as_bytes());
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(hex::encode(digest).as_bytes());
        Self(key)
    }

    /// Interpret raw bytes as a key, byte for byte.
    ///
    /// No case folding happens here: a key read off a connection must match
    /// the stored key exactly.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != KEY_LEN {
            return Err(KeyError::InvalidLength {
                expected: KEY_LEN,
                actual: bytes.len(),
            });
        }

        if let Some(offset) = bytes.iter().position(|b| !b.is_ascii_hexdigit()) {
            return Err(KeyError::InvalidDigit {
                byte: bytes[offset],
                offset,
            });
        }

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    /// Parse an operator-supplied pre-hashed key, normalizing to lowercase.
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        let mut key = Self::from_bytes(s.trim().as_bytes())?;
        key.0.make_ascii_lowercase();
        Ok(key)
    }

    /// The key as it appears on the wire.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        // Construction only admits ASCII hex digits.
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl FromStr for CredentialKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Enough to correlate log lines without printing the full credential.
        write!(f, "CredentialKey({}…)", &self.as_str()[..8])
    }
}

impl Serialize for CredentialKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CredentialKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_known_vector() {
        // sha224("password")
        let key = CredentialKey::derive("password");
        assert_eq!(
            key.as_str(),
            "d63dc919e201d7bc4c825630d2cf25fdc93d4b2f0d46706d29038d01"
        );
        assert_eq!(key.as_bytes().len(), KEY_LEN);
    }

    #[test]
    fn test_derive_is_deterministic() {
        assert_eq!(CredentialKey::derive("secret"), CredentialKey::derive("secret"));
        assert_ne!(CredentialKey::derive("secret"), CredentialKey::derive("Secret"));
    }

    #[test]
    fn test_from_bytes_rejects_wrong_length() {
        let err = CredentialKey::from_bytes(b"abcdef").unwrap_err();
        assert!(err.is_length_error());
    }

    #[test]
    fn test_from_bytes_rejects_non_hex() {
        let mut raw = *CredentialKey::derive("x").as_bytes();
        raw[10] = b'z';
        let err = CredentialKey::from_bytes(&raw).unwrap_err();
        assert_eq!(
            err,
            KeyError::InvalidDigit {
                byte: b'z',
                offset: 10
            }
        );
    }

    #[test]
    fn test_from_bytes_is_case_sensitive() {
        let key = CredentialKey::derive("secret");
        let upper = key.as_str().to_ascii_uppercase();
        let wire = CredentialKey::from_bytes(upper.as_bytes()).unwrap();
        assert_ne!(wire, key);
    }

    #[test]
    fn test_parse_normalizes_case() {
        let key = CredentialKey::derive("secret");
        let upper = key.as_str().to_ascii_uppercase();
        assert_eq!(upper.parse::<CredentialKey>().unwrap(), key);
    }

    #[test]
    fn test_serde_as_string() {
        let key = CredentialKey::derive("secret");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", key));
        let parsed: CredentialKey = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, key);

        assert!(serde_json::from_str::<CredentialKey>("\"nothex\"").is_err());
    }
}
