//! Camouflaged tunnel listener.
//!
//! This module provides:
//! - A sniffing listener that separates tunnel clients from everyone else
//! - Rewinding of consumed bytes for the fallback path
//! - The tunnel request codec
//! - A pluggable dialing capability and its direct adapter
//! - The handshake relay that moves and counts tunnel bytes
//!
//! ## Architecture
//!
//! ```text
//! Client -> ConnectionSniffer --(known key)--> HandshakeRelay -> Dialer -> Destination
//!                 |                                  |
//!                 |                          CredentialLedger::consume
//!                 |
//!                 +--(anything else)--> RewindStream -> accept() -> wrapped server
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{ConnectionSniffer, DirectDialer, HandshakeRelay, SnifferConfig};
//!
//! let ledger = Arc::new(CredentialLedger::new());
//! ledger.add("hunter2");
//!
//! let relay = HandshakeRelay::new(Arc::new(DirectDialer::new()));
//! let sniffer = Arc::new(
//!     ConnectionSniffer::bind("[::]:443".parse()?, ledger, relay, SnifferConfig::default()).await?,
//! );
//! tokio::spawn(Arc::clone(&sniffer).run());
//!
//! while let Ok((stream, peer_addr)) = sniffer.accept().await {
//!     // hand `stream` to the wrapped server
//! }
//! ```

mod dial;
mod header;
mod relay;
mod rewind;
mod sniffer;

pub use dial::{
    BoxedDatagram, BoxedStream, DatagramSocket, DialMode, Dialed, Dialer, DirectDatagram,
    DirectDialer, ProxyStream, DEFAULT_CONNECT_TIMEOUT,
};
pub use header::{Command, DatagramFrame, HeaderError, RequestHeader, TargetAddr, CRLF};
pub use relay::{HandshakeRelay, RelayError, Traffic};
pub use rewind::RewindStream;
pub use sniffer::{
    sniff, ConnectionSniffer, RawListener, SniffOutcome, SnifferConfig, SnifferStats,
    SnifferStatsSnapshot, DEFAULT_QUEUE_CAPACITY, HEADER_PREFIX_LEN,
};
