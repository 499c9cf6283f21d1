//! Error types for credential key parsing.

use thiserror::Error;

/// Errors that can occur when parsing a pre-hashed credential key.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The key does not have the fixed digest width.
    #[error("credential key must be {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// The key contains a byte that is not an ASCII hex digit.
    #[error("credential key contains non-hex byte 0x{byte:02x} at offset {offset}")]
    InvalidDigit { byte: u8, offset: usize },
}

impl KeyError {
    /// Returns true if this error is a length mismatch.
    pub fn is_length_error(&self) -> bool {
        matches!(self, KeyError::InvalidLength { .. })
    }
}
