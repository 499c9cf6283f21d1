//! Service configuration.
//!
//! Everything comes from the environment; there is no config file.

use std::net::SocketAddr;
use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use veil_credentials::CredentialKey;

/// Default listen address for the camouflaged listener.
pub const DEFAULT_LISTEN_ADDR: &str = "[::]:443";

/// Service configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the sniffing listener binds to.
    pub listen_addr: SocketAddr,

    /// Where connections without a known key are forwarded.
    pub fallback_addr: SocketAddr,

    /// Admin API bind address. The API is disabled when unset.
    pub admin_addr: Option<SocketAddr>,

    /// Bind address for tunnels over HTTP `CONNECT`. Disabled when unset.
    pub connect_addr: Option<SocketAddr>,

    /// Passwords whose keys are added at startup.
    pub passwords: Vec<String>,

    /// Pre-hashed keys added at startup.
    pub keys: Vec<CredentialKey>,

    /// Optional file the ledger is persisted to.
    pub state_file: Option<PathBuf>,

    /// How often the ledger is saved when a state file is set.
    pub persist_interval: Duration,

    /// Timeout for outbound destination connections.
    pub connect_timeout: Duration,

    /// Log every authenticated connection at info level.
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr: SocketAddr = var("VEIL_LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string())
            .parse()
            .context("VEIL_LISTEN_ADDR must be a socket address (example: [::]:443).")?;

        let fallback_addr: SocketAddr = var("VEIL_FALLBACK_ADDR")
            .context("Missing fallback address. Set VEIL_FALLBACK_ADDR (example: 127.0.0.1:8443).")?
            .parse()
            .context("VEIL_FALLBACK_ADDR must be a socket address.")?;

        let admin_addr: Option<SocketAddr> = var("VEIL_ADMIN_ADDR")
            .filter(|v| !v.trim().is_empty())
            .map(|v| v.parse())
            .transpose()
            .context("VEIL_ADMIN_ADDR must be a socket address.")?;

        let connect_addr: Option<SocketAddr> = var("VEIL_CONNECT_ADDR")
            .filter(|v| !v.trim().is_empty())
            .map(|v| v.parse())
            .transpose()
            .context("VEIL_CONNECT_ADDR must be a socket address.")?;

        let passwords = var("VEIL_PASSWORDS")
            .map(|v| split_list(&v))
            .unwrap_or_default();

        let keys = var("VEIL_KEYS")
            .map(|v| {
                split_list(&v)
                    .iter()
                    .map(|k| CredentialKey::parse(k))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()
            .context("VEIL_KEYS must be comma separated 56-character hex keys.")?
            .unwrap_or_default();

        let state_file = var("VEIL_STATE_FILE")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let persist_interval_ms: u64 = var("VEIL_PERSIST_INTERVAL_MS")
            .map(|v| v.parse())
            .transpose()
            .context("VEIL_PERSIST_INTERVAL_MS must be an integer (milliseconds).")?
            .unwrap_or(30_000);
        let persist_interval = Duration::from_millis(persist_interval_ms.max(1_000));

        let connect_timeout_ms: u64 = var("VEIL_CONNECT_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("VEIL_CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(5_000);
        let connect_timeout = Duration::from_millis(connect_timeout_ms.max(1));

        let verbose = var("VEIL_VERBOSE")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let log_level = var("VEIL_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            fallback_addr,
            admin_addr,
            connect_addr,
            passwords,
            keys,
            state_file,
            persist_interval,
            connect_timeout,
            verbose,
            log_level,
        })
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
