//! Handshake decoding and traffic relay for authenticated tunnels.
//!
//! Runs after the credential key and its CR LF have been consumed:
//! - decode the request header
//! - open the destination through the [`Dialer`]
//! - connect: copy bytes both ways until either direction ends
//! - udp associate: translate frames to datagrams and back until the
//!   client stream ends
//!
//! Byte counts are reported even when the relay fails part way, so usage
//! can still be charged to the credential.

use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::dial::{DatagramSocket, DialMode, Dialer};
use super::header::{Command, DatagramFrame, HeaderError, RequestHeader, TargetAddr};

/// Copy buffer size for stream relays.
const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Largest datagram accepted from a destination.
const MAX_DATAGRAM_SIZE: usize = u16::MAX as usize;

/// Bytes moved through one tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Traffic {
    /// Bytes received from the client and forwarded.
    pub uploaded: u64,
    /// Bytes delivered back to the client.
    pub downloaded: u64,
}

impl fmt::Display for Traffic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "up={} down={}", self.uploaded, self.downloaded)
    }
}

/// Why a tunnel ended abnormally.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Header after a valid key was malformed. Nothing was relayed.
    #[error("malformed request header: {0}")]
    Decode(#[from] HeaderError),

    /// The destination could not be opened. Nothing was relayed.
    #[error("failed to dial {target}: {source}")]
    Dial {
        target: TargetAddr,
        #[source]
        source: io::Error,
    },

    /// I/O failed mid-relay; `traffic` is what got through before that.
    #[error("relay with {target} failed ({traffic}): {source}")]
    Io {
        target: TargetAddr,
        traffic: Traffic,
        #[source]
        source: io::Error,
    },
}

impl RelayError {
    /// Bytes transferred before the failure.
    pub fn traffic(&self) -> Traffic {
        match self {
            RelayError::Io { traffic, .. } => *traffic,
            RelayError::Decode(_) | RelayError::Dial { .. } => Traffic::default(),
        }
    }
}

/// Decodes tunnel requests and relays them through a dialer.
#[derive(Clone)]
pub struct HandshakeRelay {
    dialer: Arc<dyn Dialer>,
}

impl HandshakeRelay {
    /// Create a relay that opens destinations with `dialer`.
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self { dialer }
    }

    /// Serve one tunnel on `client`, positioned just after the key's CR LF.
    pub async fn run<S>(&self, client: &mut S) -> Result<Traffic, RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let header = RequestHeader::read_from(client).await?;
        debug!(command = %header.command, target = %header.target, "Tunnel request decoded");

        match header.command {
            Command::Connect => self.relay_stream(client, header.target).await,
            Command::UdpAssociate => self.relay_datagrams(client, header.target).await,
        }
    }

    async fn relay_stream<S>(&self, client: &mut S, target: TargetAddr) -> Result<Traffic, RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let remote = match self.dialer.dial(&target, DialMode::Stream).await {
            Ok(dialed) => dialed.into_stream(),
            Err(e) => Err(e),
        };
        let remote = match remote {
            Ok(remote) => remote,
            Err(source) => return Err(RelayError::Dial { target, source }),
        };

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut remote_read, mut remote_write) = tokio::io::split(remote);

        let mut traffic = Traffic::default();
        let result = {
            let upload = pipe(&mut client_read, &mut remote_write, &mut traffic.uploaded);
            let download = pipe(&mut remote_read, &mut client_write, &mut traffic.downloaded);

            // Whichever direction finishes first ends the tunnel.
            tokio::select! {
                result = upload => result,
                result = download => result,
            }
        };

        debug!(target = %target, %traffic, "Stream relay finished");

        match result {
            Ok(()) => Ok(traffic),
            Err(source) => Err(RelayError::Io {
                target,
                traffic,
                source,
            }),
        }
    }

    async fn relay_datagrams<S>(
        &self,
        client: &mut S,
        target: TargetAddr,
    ) -> Result<Traffic, RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let socket = match self.dialer.dial(&target, DialMode::Datagram).await {
            Ok(dialed) => dialed.into_datagram(),
            Err(e) => Err(e),
        };
        let socket = match socket {
            Ok(socket) => socket,
            Err(source) => return Err(RelayError::Dial { target, source }),
        };

        let (mut client_read, mut client_write) = tokio::io::split(client);

        let mut traffic = Traffic::default();
        let result = {
            let upload = forward_datagrams(&mut client_read, socket.as_ref(), &mut traffic.uploaded);
            let download =
                return_datagrams(socket.as_ref(), &mut client_write, &mut traffic.downloaded);

            // The download side only ends on error; a closed client ends the upload side.
            tokio::select! {
                result = upload => result,
                result = download => result,
            }
        };

        debug!(target = %target, %traffic, "Datagram relay finished");

        match result {
            Ok(()) => Ok(traffic),
            Err(source) => Err(RelayError::Io {
                target,
                traffic,
                source,
            }),
        }
    }
}

/// Copy `reader` into `writer` until EOF, counting bytes written.
async fn pipe<R, W>(reader: &mut R, writer: &mut W, counter: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        *counter += n as u64;
    }
    writer.shutdown().await
}

/// Client frames → destination datagrams. Ends cleanly when the client closes.
async fn forward_datagrams<R>(
    reader: &mut R,
    socket: &dyn DatagramSocket,
    counter: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = DatagramFrame::read_from(reader).await? {
        match socket.send_to(&frame.payload, &frame.target).await {
            Ok(_) => *counter += frame.payload.len() as u64,
            // Datagrams are lossy; one unreachable destination does not end the tunnel.
            Err(e) => warn!(target = %frame.target, error = %e, "Dropped datagram"),
        }
    }
    Ok(())
}

/// Destination datagrams → client frames. Ends only on error.
async fn return_datagrams<W>(
    socket: &dyn DatagramSocket,
    writer: &mut W,
    counter: &mut u64,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut frame = Vec::with_capacity(MAX_DATAGRAM_SIZE + 32);
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        frame.clear();
        DatagramFrame::encode_into(&from, &buf[..n], &mut frame)?;
        writer.write_all(&frame).await?;
        *counter += n as u64;
    }
}
