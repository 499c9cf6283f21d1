//! Fallback forwarding.
//!
//! Connections that did not present a known key are piped, rewound
//! prefix included, to the server this listener is camouflaging.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn, Instrument};

use crate::proxy::{ConnectionSniffer, RawListener};

/// Drain `sniffer.accept()` and forward each connection to `fallback_addr`.
///
/// Returns once the sniffer is closed.
pub async fn serve_fallback<L: RawListener>(
    sniffer: Arc<ConnectionSniffer<L>>,
    fallback_addr: SocketAddr,
) {
    info!(fallback_addr = %fallback_addr, "Fallback forwarder started");

    loop {
        let (client, peer_addr) = match sniffer.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                info!(reason = %e, "Fallback forwarder stopped");
                return;
            }
        };

        tokio::spawn(
            async move {
                if let Err(e) = forward(client, fallback_addr).await {
                    debug!(error = %e, "Fallback connection error");
                }
            }
            .instrument(tracing::info_span!("fallback", peer = %peer_addr)),
        );
    }
}

async fn forward<S>(mut client: S, fallback_addr: SocketAddr) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut backend = match TcpStream::connect(fallback_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(fallback_addr = %fallback_addr, error = %e, "Fallback server unreachable");
            return Ok(());
        }
    };
    backend.set_nodelay(true)?;

    let (to_backend, from_backend) = proxy_bidirectional(&mut client, &mut backend).await;
    debug!(
        bytes_to_backend = to_backend,
        bytes_from_backend = from_backend,
        "Fallback connection closed"
    );
    Ok(())
}

/// Copy both ways until each side has finished, so half-closed connections
/// still drain.
///
/// Returns (bytes_to_b, bytes_from_b).
pub async fn proxy_bidirectional<A, B>(a: &mut A, b: &mut B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let (a_to_b, b_to_a) = tokio::join!(
        copy_half(&mut a_read, &mut b_write),
        copy_half(&mut b_read, &mut a_write)
    );
    (a_to_b, b_to_a)
}

/// Returns what was copied even if the direction ended in an error.
async fn copy_half<R, W>(reader: &mut R, writer: &mut W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if writer.write_all(&buf[..n]).await.is_err() {
                    return total;
                }
                total += n as u64;
            }
            Err(_) => break,
        }
    }
    let _ = writer.shutdown().await;
    total
}
