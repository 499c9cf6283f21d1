//! veil ingress.
//!
//! A TCP listener that serves authenticated tunnel clients and passes every
//! other connection, byte for byte, to the server it is camouflaging.

pub mod admin;
pub mod config;
pub mod connect;
pub mod fallback;
pub mod proxy;

pub use config::Config;
pub use proxy::{
    ConnectionSniffer, Dialer, DirectDialer, HandshakeRelay, RelayError, RewindStream,
    SnifferConfig, TargetAddr, Traffic,
};
