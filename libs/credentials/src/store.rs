//! Ledger persistence.
//!
//! Saves credentials and their counters to a JSON file so usage survives
//! restarts:
//! - write to a temp file, then rename over the old state
//! - a missing file means an empty ledger
//! - a file from another format version is ignored with a warning

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::key::CredentialKey;
use crate::ledger::{CredentialLedger, CredentialUsage};

/// Persisted ledger file format version.
const STATE_VERSION: u32 = 1;

/// Persisted ledger.
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedLedger {
    /// Format version.
    pub version: u32,
    /// Credentials with their counters.
    pub credentials: Vec<PersistedCredential>,
}

impl Default for PersistedLedger {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            credentials: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedCredential {
    pub key: CredentialKey,
    pub up: u64,
    pub down: u64,
}

impl From<CredentialUsage> for PersistedCredential {
    fn from(usage: CredentialUsage) -> Self {
        Self {
            key: usage.key,
            up: usage.uploaded,
            down: usage.downloaded,
        }
    }
}

impl From<&PersistedCredential> for CredentialUsage {
    fn from(credential: &PersistedCredential) -> Self {
        Self {
            key: credential.key,
            uploaded: credential.up,
            downloaded: credential.down,
        }
    }
}

/// Ledger persistence manager.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    /// Path to the state file.
    state_path: PathBuf,
}

impl LedgerStore {
    /// Create a new ledger store.
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        Self {
            state_path: state_path.into(),
        }
    }

    /// Path of the state file.
    pub fn path(&self) -> &Path {
        &self.state_path
    }

    /// Load state from disk.
    ///
    /// Returns default state if the file doesn't exist.
    /// Returns error if the file exists but is invalid.
    pub fn load(&self) -> Result<PersistedLedger> {
        if !self.state_path.exists() {
            debug!(path = %self.state_path.display(), "No ledger file, starting fresh");
            return Ok(PersistedLedger::default());
        }

        let content = fs::read_to_string(&self.state_path)
            .with_context(|| format!("Failed to read ledger file: {}", self.state_path.display()))?;

        let state: PersistedLedger = serde_json::from_str(&content).with_context(|| {
            format!("Failed to parse ledger file: {}", self.state_path.display())
        })?;

        if state.version != STATE_VERSION {
            warn!(
                file_version = state.version,
                current_version = STATE_VERSION,
                "Ledger file version mismatch, starting fresh"
            );
            return Ok(PersistedLedger::default());
        }

        info!(
            path = %self.state_path.display(),
            credential_count = state.credentials.len(),
            "Loaded ledger from disk"
        );

        Ok(state)
    }

    /// Load state from disk into `ledger`. Returns the number restored.
    pub fn restore_into(&self, ledger: &CredentialLedger) -> Result<usize> {
        let state = self.load()?;
        let restored = state
            .credentials
            .iter()
            .filter(|credential| ledger.restore(CredentialUsage::from(*credential)))
            .count();
        Ok(restored)
    }

    /// Save state to disk atomically.
    pub fn save(&self, state: &PersistedLedger) -> Result<()> {
        if let Some(parent) = self.state_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let tmp_path = self.state_path.with_extension("tmp");
        let content = serde_json::to_string_pretty(state).context("Failed to serialize ledger")?;

        fs::write(&tmp_path, &content)
            .with_context(|| format!("Failed to write temp file: {}", tmp_path.display()))?;

        fs::rename(&tmp_path, &self.state_path).with_context(|| {
            format!(
                "Failed to rename {} -> {}",
                tmp_path.display(),
                self.state_path.display()
            )
        })?;

        debug!(
            path = %self.state_path.display(),
            credential_count = state.credentials.len(),
            "Saved ledger to disk"
        );

        Ok(())
    }

    /// Snapshot `ledger` and save it.
    pub fn save_ledger(&self, ledger: &CredentialLedger) -> Result<()> {
        let state = PersistedLedger {
            version: STATE_VERSION,
            credentials: ledger.snapshot().into_iter().map(Into::into).collect(),
        };
        self.save(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env::temp_dir;

    fn temp_path(name: &str) -> PathBuf {
        temp_dir().join(format!("veil-ledger-{}-{}.json", name, std::process::id()))
    }

    #[test]
    fn test_missing_file_is_empty() {
        let store = LedgerStore::new(temp_path("missing"));
        let state = store.load().unwrap();
        assert_eq!(state.version, STATE_VERSION);
        assert!(state.credentials.is_empty());
    }

    #[test]
    fn test_ledger_roundtrip() {
        let path = temp_path("roundtrip");
        let store = LedgerStore::new(path.clone());

        let ledger = CredentialLedger::new();
        let a = ledger.add("alice");
        let b = ledger.add("bob");
        ledger.consume(&a, 100, 2000);

        store.save_ledger(&ledger).unwrap();

        let restored = CredentialLedger::new();
        assert_eq!(store.restore_into(&restored).unwrap(), 2);
        assert_eq!(restored.snapshot(), ledger.snapshot());
        assert!(restored.contains(&b));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_version_mismatch_starts_fresh() {
        let path = temp_path("version");
        fs::write(&path, r#"{"version": 99, "credentials": []}"#).unwrap();

        let state = LedgerStore::new(path.clone()).load().unwrap();
        assert_eq!(state.version, STATE_VERSION);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let path = temp_path("corrupt");
        fs::write(&path, "not json").unwrap();

        assert!(LedgerStore::new(path.clone()).load().is_err());

        let _ = fs::remove_file(&path);
    }
}
