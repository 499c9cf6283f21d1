//! veil
//!
//! Camouflaged tunnel listener.
//!
//! This service:
//! - Accepts TCP connections on one listener
//! - Serves tunnels for clients presenting a known credential key
//! - Forwards everything else, untouched, to a fallback server
//! - Optionally serves tunnels over HTTP `CONNECT` on a second listener
//! - Optionally exposes an admin API for credential management
//! - Optionally persists credential usage across restarts

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use veil_credentials::{CredentialLedger, LedgerStore};
use veil_ingress::proxy::{ConnectionSniffer, DirectDialer, HandshakeRelay, SnifferConfig};
use veil_ingress::{admin, connect, fallback, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to VEIL_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting veil");
    info!(
        listen_addr = %config.listen_addr,
        fallback_addr = %config.fallback_addr,
        admin_enabled = config.admin_addr.is_some(),
        connect_enabled = config.connect_addr.is_some(),
        persistence_enabled = config.state_file.is_some(),
        "Configuration loaded"
    );

    // Restore persisted usage before adding configured credentials
    let ledger = Arc::new(CredentialLedger::new());
    let store = config.state_file.clone().map(LedgerStore::new);
    if let Some(store) = &store {
        let restored = store.restore_into(&ledger)?;
        info!(path = %store.path().display(), restored, "Ledger state loaded");
    }
    for password in &config.passwords {
        ledger.add(password);
    }
    for key in &config.keys {
        ledger.add_key(*key);
    }
    info!(credentials = ledger.len(), "Ledger ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let relay = HandshakeRelay::new(Arc::new(DirectDialer::with_timeout(config.connect_timeout)));
    let sniffer_config = SnifferConfig {
        verbose: config.verbose,
        ..SnifferConfig::default()
    };
    let sniffer = Arc::new(
        ConnectionSniffer::bind(
            config.listen_addr,
            Arc::clone(&ledger),
            relay.clone(),
            sniffer_config,
        )
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?,
    );

    let sniffer_handle = tokio::spawn(Arc::clone(&sniffer).run());
    let fallback_handle = tokio::spawn(fallback::serve_fallback(
        Arc::clone(&sniffer),
        config.fallback_addr,
    ));

    let admin_handle = match config.admin_addr {
        Some(admin_addr) => {
            let listener = tokio::net::TcpListener::bind(admin_addr)
                .await
                .with_context(|| format!("Failed to bind admin API on {}", admin_addr))?;
            let ledger = Arc::clone(&ledger);
            let shutdown_rx = shutdown_rx.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = admin::serve(listener, ledger, shutdown_rx).await {
                    error!(error = %e, "Admin API error");
                }
            }))
        }
        None => None,
    };

    let connect_handle = match config.connect_addr {
        Some(connect_addr) => {
            let listener = tokio::net::TcpListener::bind(connect_addr)
                .await
                .with_context(|| format!("Failed to bind CONNECT front on {}", connect_addr))?;
            let app = connect::router(
                axum::Router::new(),
                Arc::clone(&ledger),
                relay,
                config.verbose,
            );
            let shutdown_rx = shutdown_rx.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = connect::serve(listener, app, shutdown_rx).await {
                    error!(error = %e, "CONNECT front error");
                }
            }))
        }
        None => None,
    };

    let persist_handle = store.clone().map(|store| {
        let ledger = Arc::clone(&ledger);
        let shutdown_rx = shutdown_rx.clone();
        let interval = config.persist_interval;
        tokio::spawn(async move { run_persist_loop(store, ledger, interval, shutdown_rx).await })
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = sniffer_handle => {
            match result {
                Ok(Ok(())) => info!("Sniffer exited"),
                Ok(Err(e)) => error!(error = %e, "Sniffer error"),
                Err(e) => error!(error = %e, "Sniffer task panicked"),
            }
        }
    }

    // Stop accepting; tunnels already relaying finish on their own
    sniffer.close();
    let _ = shutdown_tx.send(true);

    if let Err(e) = fallback_handle.await {
        error!(error = %e, "Fallback task panicked");
    }
    if let Some(handle) = admin_handle {
        let _ = handle.await;
    }
    if let Some(handle) = connect_handle {
        let _ = handle.await;
    }
    if let Some(handle) = persist_handle {
        let _ = handle.await;
    }

    if let Some(store) = &store {
        store
            .save_ledger(&ledger)
            .context("Failed to save ledger state on shutdown")?;
        info!(path = %store.path().display(), "Ledger state saved");
    }

    info!(stats = ?sniffer.stats().snapshot(), "veil shutdown complete");
    Ok(())
}

/// Save the ledger every `interval` until shutdown.
async fn run_persist_loop(
    store: LedgerStore,
    ledger: Arc<CredentialLedger>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = store.save_ledger(&ledger) {
                    warn!(error = %e, "Failed to save ledger state");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
