//! # veil-credentials
//!
//! Credential keys and the usage ledger shared by every connection the
//! veil listener authenticates.
//!
//! ## Keys
//!
//! A credential key is the lowercase hex SHA-224 digest of a password:
//! always [`KEY_LEN`] ASCII bytes. The same bytes appear verbatim at the
//! start of every tunnel connection, so lookups are done on raw bytes.
//!
//! ## Ledger
//!
//! [`CredentialLedger`] maps keys to upload/download counters. Lookups read
//! an immutable snapshot and never wait on writers; counters are atomics
//! shared between snapshots so concurrent relays for one key never lose
//! updates.

mod error;
mod key;
mod ledger;
mod store;

pub use error::KeyError;
pub use key::{CredentialKey, KEY_LEN};
pub use ledger::{CredentialLedger, CredentialUsage};
pub use store::{LedgerStore, PersistedCredential, PersistedLedger};
