//! Credential sniffing listener.
//!
//! Every accepted connection is inspected in its own task. The first 58
//! bytes are read one at a time; a line feed before the key's terminator,
//! an unknown key, or a read error sends the connection to the fallback
//! queue with every consumed byte rewound. A known key hands the rest of
//! the stream to the [`HandshakeRelay`], and the relayed byte counts are
//! charged to that key once the tunnel ends.
//!
//! Fallback connections are drained through [`ConnectionSniffer::accept`],
//! so the wrapped server sees exactly what the client sent.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn, Instrument};
use veil_credentials::{CredentialKey, CredentialLedger, KEY_LEN};

use super::header::{HeaderError, CRLF};
use super::relay::{HandshakeRelay, RelayError, Traffic};
use super::rewind::RewindStream;

/// Bytes inspected before a connection is classified: the key and its CR LF.
pub const HEADER_PREFIX_LEN: usize = KEY_LEN + 2;

/// Default depth of the fallback queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 8;

/// Pause after a failed raw accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Result of inspecting the start of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniffOutcome {
    /// Not ours; replay these bytes to the fallback consumer.
    Fallback(Vec<u8>),
    /// The peer closed before anything could be decided.
    Abandoned { bytes_read: usize },
    /// A known key. `terminator` holds the two bytes after it.
    Authenticated {
        key: CredentialKey,
        terminator: [u8; 2],
    },
}

/// Classify a connection by reading at most [`HEADER_PREFIX_LEN`] bytes.
///
/// Reads a single byte at a time so nothing past the decision point is
/// consumed.
pub async fn sniff<S>(stream: &mut S, ledger: &CredentialLedger) -> SniffOutcome
where
    S: AsyncRead + Unpin,
{
    let mut prefix = Vec::with_capacity(HEADER_PREFIX_LEN);
    let mut byte = [0u8; 1];

    while prefix.len() < HEADER_PREFIX_LEN {
        match stream.read(&mut byte).await {
            Ok(0) => {
                return SniffOutcome::Abandoned {
                    bytes_read: prefix.len(),
                }
            }
            Ok(_) => {
                prefix.push(byte[0]);
                // An LF anywhere but the last position cannot be our header.
                if byte[0] == b'\n' && prefix.len() < HEADER_PREFIX_LEN {
                    return SniffOutcome::Fallback(prefix);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return SniffOutcome::Abandoned {
                    bytes_read: prefix.len(),
                }
            }
            Err(e) => {
                debug!(error = %e, bytes_read = prefix.len(), "Read failed while sniffing");
                return SniffOutcome::Fallback(prefix);
            }
        }
    }

    let candidate = &prefix[..KEY_LEN];
    if !ledger.validate(candidate) {
        return SniffOutcome::Fallback(prefix);
    }

    match CredentialKey::from_bytes(candidate) {
        Ok(key) => SniffOutcome::Authenticated {
            key,
            terminator: [prefix[KEY_LEN], prefix[KEY_LEN + 1]],
        },
        Err(_) => SniffOutcome::Fallback(prefix),
    }
}

/// Source of raw connections for a [`ConnectionSniffer`].
#[async_trait]
pub trait RawListener: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Accept the next raw connection.
    async fn accept(&self) -> io::Result<(Self::Stream, SocketAddr)>;

    /// Address the listener is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl RawListener for TcpListener {
    type Stream = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Configuration for a sniffer.
#[derive(Debug, Clone)]
pub struct SnifferConfig {
    /// Fallback connections that may wait for `accept` before sniffing
    /// tasks block.
    pub queue_capacity: usize,
    /// Log each authenticated connection at info level.
    pub verbose: bool,
}

impl Default for SnifferConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            verbose: false,
        }
    }
}

/// Counters for a sniffer.
#[derive(Debug, Default)]
pub struct SnifferStats {
    /// Raw connections accepted.
    pub accepted: AtomicU64,
    /// Connections handed to the fallback queue.
    pub fallback: AtomicU64,
    /// Connections that closed before classification.
    pub abandoned: AtomicU64,
    /// Connections presenting a known key.
    pub authenticated: AtomicU64,
    /// Authenticated connections whose tunnel failed.
    pub relay_failures: AtomicU64,
    /// Tunnel bytes received from clients.
    pub bytes_uploaded: AtomicU64,
    /// Tunnel bytes sent to clients.
    pub bytes_downloaded: AtomicU64,
}

/// Point-in-time copy of [`SnifferStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SnifferStatsSnapshot {
    pub accepted: u64,
    pub fallback: u64,
    pub abandoned: u64,
    pub authenticated: u64,
    pub relay_failures: u64,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
}

impl SnifferStats {
    pub fn snapshot(&self) -> SnifferStatsSnapshot {
        SnifferStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            fallback: self.fallback.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            authenticated: self.authenticated.load(Ordering::Relaxed),
            relay_failures: self.relay_failures.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
        }
    }

    fn record_traffic(&self, traffic: Traffic) {
        self.bytes_uploaded
            .fetch_add(traffic.uploaded, Ordering::Relaxed);
        self.bytes_downloaded
            .fetch_add(traffic.downloaded, Ordering::Relaxed);
    }
}

type Pending<S> = (RewindStream<S>, SocketAddr);

/// A listener that serves tunnels for known keys and passes everything
/// else through untouched.
pub struct ConnectionSniffer<L: RawListener> {
    listener: L,
    ledger: Arc<CredentialLedger>,
    relay: HandshakeRelay,
    config: SnifferConfig,
    pending_tx: mpsc::Sender<Pending<L::Stream>>,
    pending_rx: Mutex<mpsc::Receiver<Pending<L::Stream>>>,
    closed: watch::Sender<bool>,
    stats: SnifferStats,
}

impl ConnectionSniffer<TcpListener> {
    /// Bind a TCP listener and wrap it.
    pub async fn bind(
        addr: SocketAddr,
        ledger: Arc<CredentialLedger>,
        relay: HandshakeRelay,
        config: SnifferConfig,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(bind_addr = %listener.local_addr()?, "Sniffer bound");
        Ok(Self::new(listener, ledger, relay, config))
    }
}

impl<L: RawListener> ConnectionSniffer<L> {
    /// Wrap an already bound listener.
    pub fn new(
        listener: L,
        ledger: Arc<CredentialLedger>,
        relay: HandshakeRelay,
        config: SnifferConfig,
    ) -> Self {
        let (pending_tx, pending_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (closed, _) = watch::channel(false);

        Self {
            listener,
            ledger,
            relay,
            config,
            pending_tx,
            pending_rx: Mutex::new(pending_rx),
            closed,
            stats: SnifferStats::default(),
        }
    }

    /// Address of the wrapped listener.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Sniffer counters.
    pub fn stats(&self) -> &SnifferStats {
        &self.stats
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Accept raw connections.
    ///
    /// Once the sniffer is closed, each new connection is closed as soon as
    /// it is accepted. Only returns on a failure to read the bound address.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Sniffer started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    if self.is_closed() {
                        debug!(peer_addr = %peer_addr, "Sniffer closed, dropping connection");
                        drop(stream);
                        continue;
                    }
                    self.stats.accepted.fetch_add(1, Ordering::Relaxed);

                    let sniffer = Arc::clone(&self);
                    tokio::spawn(
                        async move {
                            sniffer.handle_connection(stream, peer_addr).await;
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    /// Next connection that did not present a known key.
    ///
    /// The returned stream replays every byte the sniffer consumed. Fails
    /// with "listener closed" once [`close`](Self::close) has been called.
    pub async fn accept(&self) -> io::Result<(RewindStream<L::Stream>, SocketAddr)> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            self.drain_pending();
            return Err(listener_closed());
        }

        let next = tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => None,
            next = async { self.pending_rx.lock().await.recv().await } => next,
        };

        match next {
            Some(pending) => Ok(pending),
            None => {
                self.drain_pending();
                Err(listener_closed())
            }
        }
    }

    /// Stop accepting. Safe to call more than once.
    ///
    /// Pending `accept` calls fail, queued fallback connections are closed,
    /// new raw connections are closed on arrival, and tunnels already
    /// relaying run to completion.
    pub fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        info!("Sniffer closed");
        self.drain_pending();
    }

    fn drain_pending(&self) {
        // A concurrent accept holding the lock drains on its way out.
        if let Ok(mut pending) = self.pending_rx.try_lock() {
            pending.close();
            while pending.try_recv().is_ok() {}
        }
    }

    async fn handle_connection(&self, mut stream: L::Stream, peer_addr: SocketAddr) {
        match sniff(&mut stream, &self.ledger).await {
            SniffOutcome::Abandoned { bytes_read } => {
                self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
                debug!(bytes_read, "Connection closed before classification");
            }
            SniffOutcome::Fallback(prefix) => {
                debug!(rewound = prefix.len(), "Passing connection to fallback");
                self.enqueue(RewindStream::new(stream, prefix), peer_addr)
                    .await;
            }
            SniffOutcome::Authenticated { key, terminator } => {
                self.serve_tunnel(stream, key, terminator).await;
            }
        }
    }

    async fn enqueue(&self, conn: RewindStream<L::Stream>, peer_addr: SocketAddr) {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            debug!("Sniffer closed, dropping fallback connection");
            return;
        }

        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => {
                debug!("Sniffer closed, dropping fallback connection");
            }
            sent = self.pending_tx.send((conn, peer_addr)) => match sent {
                Ok(()) => {
                    self.stats.fallback.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => debug!("Fallback queue closed, dropping connection"),
            },
        }
    }

    async fn serve_tunnel(&self, mut stream: L::Stream, key: CredentialKey, terminator: [u8; 2]) {
        self.stats.authenticated.fetch_add(1, Ordering::Relaxed);
        if self.config.verbose {
            info!(key = %key, "Authenticated connection");
        } else {
            debug!(key = %key, "Authenticated connection");
        }

        let result = if terminator == CRLF {
            self.relay.run(&mut stream).await
        } else {
            Err(RelayError::Decode(HeaderError::MissingCrlf(terminator)))
        };

        let traffic = match &result {
            Ok(traffic) => *traffic,
            Err(e) => e.traffic(),
        };
        self.ledger
            .consume(&key, traffic.uploaded, traffic.downloaded);
        self.stats.record_traffic(traffic);

        match result {
            Ok(traffic) => debug!(key = %key, %traffic, "Tunnel closed"),
            Err(e) => {
                self.stats.relay_failures.fetch_add(1, Ordering::Relaxed);
                if matches!(e, RelayError::Decode(_)) {
                    warn!(key = %key, error = %e, "Rejected tunnel request");
                } else {
                    debug!(key = %key, error = %e, "Tunnel failed");
                }
            }
        }

        let _ = stream.shutdown().await;
    }
}

fn listener_closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "listener closed")
}
