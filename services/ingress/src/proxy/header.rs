//! Tunnel request header and datagram frame codec.
//!
//! Wire format after the credential key:
//! - 2 bytes: CR LF
//! - 1 byte: command (0x01 connect, 0x03 udp associate)
//! - 1 byte: address type (0x01 IPv4, 0x03 domain, 0x04 IPv6)
//! - variable: address (4 bytes, 1 length byte + name, or 16 bytes)
//! - 2 bytes: port, big-endian
//! - 2 bytes: CR LF
//!
//! UDP associate frames on the tunnel stream:
//! - 2 bytes: payload length, big-endian
//! - address type, address, port as above
//! - payload

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Line terminator following the key and the request header.
pub const CRLF: [u8; 2] = *b"\r\n";

/// Address type: IPv4 (4 bytes).
const ATYP_IPV4: u8 = 0x01;

/// Address type: domain name (1 length byte + name).
const ATYP_DOMAIN: u8 = 0x03;

/// Address type: IPv6 (16 bytes).
const ATYP_IPV6: u8 = 0x04;

/// Errors decoding or encoding a request header or datagram frame.
#[derive(Debug, Error)]
pub enum HeaderError {
    /// Command byte is neither connect nor udp associate.
    #[error("unknown command 0x{0:02x}")]
    UnknownCommand(u8),

    /// Address type byte is not IPv4, domain, or IPv6.
    #[error("unknown address type 0x{0:02x}")]
    UnknownAddressType(u8),

    /// Domain name is empty or not UTF-8.
    #[error("invalid domain name")]
    InvalidDomain,

    /// Domain name does not fit the 1-byte length prefix.
    #[error("domain name too long: {0} bytes")]
    DomainTooLong(usize),

    /// Datagram payload does not fit the 2-byte length prefix.
    #[error("datagram payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Expected CR LF, found something else.
    #[error("expected CRLF, got {0:02x?}")]
    MissingCrlf([u8; 2]),

    /// Stream failed or ended mid-header.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<HeaderError> for io::Error {
    fn from(err: HeaderError) -> Self {
        match err {
            HeaderError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// Requested tunnel mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Relay a TCP stream to the target.
    Connect,
    /// Relay framed datagrams over the tunnel stream.
    UdpAssociate,
}

impl Command {
    /// Wire value of the command.
    pub fn as_u8(self) -> u8 {
        match self {
            Command::Connect => 0x01,
            Command::UdpAssociate => 0x03,
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = HeaderError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Connect),
            0x03 => Ok(Command::UdpAssociate),
            other => Err(HeaderError::UnknownCommand(other)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Connect => write!(f, "connect"),
            Command::UdpAssociate => write!(f, "udp_associate"),
        }
    }
}

/// Destination named in a header or frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    /// Literal IP address and port.
    Socket(SocketAddr),
    /// Domain name and port, resolved by the dialer.
    Domain(String, u16),
}

impl TargetAddr {
    /// Destination port.
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Socket(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// Decode address type, address, and port.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, HeaderError> {
        let atyp = reader.read_u8().await?;
        match atyp {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                reader.read_exact(&mut octets).await?;
                let port = reader.read_u16().await?;
                Ok(TargetAddr::Socket(SocketAddr::V4(SocketAddrV4::new(
                    Ipv4Addr::from(octets),
                    port,
                ))))
            }
            ATYP_DOMAIN => {
                let len = reader.read_u8().await? as usize;
                let mut name = vec![0u8; len];
                reader.read_exact(&mut name).await?;
                let port = reader.read_u16().await?;
                let name = String::from_utf8(name).map_err(|_| HeaderError::InvalidDomain)?;
                if name.is_empty() {
                    return Err(HeaderError::InvalidDomain);
                }
                Ok(TargetAddr::Domain(name, port))
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                reader.read_exact(&mut octets).await?;
                let port = reader.read_u16().await?;
                Ok(TargetAddr::Socket(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(octets),
                    port,
                    0,
                    0,
                ))))
            }
            other => Err(HeaderError::UnknownAddressType(other)),
        }
    }

    /// Append address type, address, and port to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), HeaderError> {
        match self {
            TargetAddr::Socket(SocketAddr::V4(addr)) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&addr.ip().octets());
            }
            TargetAddr::Socket(SocketAddr::V6(addr)) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&addr.ip().octets());
            }
            TargetAddr::Domain(name, _) => {
                let len = u8::try_from(name.len())
                    .map_err(|_| HeaderError::DomainTooLong(name.len()))?;
                if len == 0 {
                    return Err(HeaderError::InvalidDomain);
                }
                buf.push(ATYP_DOMAIN);
                buf.push(len);
                buf.extend_from_slice(name.as_bytes());
            }
        }
        buf.extend_from_slice(&self.port().to_be_bytes());
        Ok(())
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Socket(addr)
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Socket(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(name, port) => write!(f, "{}:{}", name, port),
        }
    }
}

/// Decoded request header (everything after the key and its CR LF).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub command: Command,
    pub target: TargetAddr,
}

impl RequestHeader {
    /// Create a new request header.
    pub fn new(command: Command, target: impl Into<TargetAddr>) -> Self {
        Self {
            command,
            target: target.into(),
        }
    }

    /// Decode a header from a stream positioned just after the key's CR LF.
    ///
    /// Consumes exactly the header bytes, including the trailing CR LF.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, HeaderError> {
        let command = Command::try_from(reader.read_u8().await?)?;
        let target = TargetAddr::read_from(reader).await?;
        read_crlf(reader).await?;
        Ok(Self { command, target })
    }

    /// Encode the header, without the key prefix.
    pub fn encode(&self) -> Result<Vec<u8>, HeaderError> {
        let mut buf = Vec::with_capacity(1 + 1 + 1 + 255 + 2 + 2);
        buf.push(self.command.as_u8());
        self.target.encode(&mut buf)?;
        buf.extend_from_slice(&CRLF);
        Ok(buf)
    }
}

/// One datagram carried over a udp associate tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatagramFrame {
    /// Destination (client to target) or source (target to client).
    pub target: TargetAddr,
    pub payload: Vec<u8>,
}

impl DatagramFrame {
    /// Decode the next frame.
    ///
    /// Returns `None` when the stream ends cleanly on a frame boundary.
    pub async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
    ) -> Result<Option<Self>, HeaderError> {
        let mut len = [0u8; 2];
        if reader.read(&mut len[..1]).await? == 0 {
            return Ok(None);
        }
        reader.read_exact(&mut len[1..]).await?;
        let len = u16::from_be_bytes(len) as usize;

        let target = TargetAddr::read_from(reader).await?;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;

        Ok(Some(Self { target, payload }))
    }

    /// Append the encoded frame to `buf`.
    pub fn encode_into(
        target: &TargetAddr,
        payload: &[u8],
        buf: &mut Vec<u8>,
    ) -> Result<(), HeaderError> {
        let len = u16::try_from(payload.len())
            .map_err(|_| HeaderError::PayloadTooLarge(payload.len()))?;
        buf.extend_from_slice(&len.to_be_bytes());
        target.encode(buf)?;
        buf.extend_from_slice(payload);
        Ok(())
    }

    /// Encode this frame.
    pub fn encode(&self) -> Result<Vec<u8>, HeaderError> {
        let mut buf = Vec::with_capacity(2 + 1 + 16 + 2 + self.payload.len());
        Self::encode_into(&self.target, &self.payload, &mut buf)?;
        Ok(buf)
    }
}

async fn read_crlf<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(), HeaderError> {
    let mut terminator = [0u8; 2];
    reader.read_exact(&mut terminator).await?;
    if terminator != CRLF {
        return Err(HeaderError::MissingCrlf(terminator));
    }
    Ok(())
}
