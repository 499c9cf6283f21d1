//! Dialing capability used by the relay to reach destinations.
//!
//! The relay only sees the [`Dialer`] trait; how a destination is actually
//! reached (directly, or through some upstream proxy) is up to the adapter.
//! [`DirectDialer`] connects straight out from this host.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

use super::header::TargetAddr;

/// Default connect timeout for destination connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A bidirectional byte stream to a destination.
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

/// Boxed destination stream.
pub type BoxedStream = Box<dyn ProxyStream>;

/// A datagram socket able to reach any destination.
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    /// Send one datagram to `target`.
    async fn send_to(&self, payload: &[u8], target: &TargetAddr) -> io::Result<usize>;

    /// Receive one datagram and the address it came from.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, TargetAddr)>;
}

/// Boxed destination datagram socket.
pub type BoxedDatagram = Box<dyn DatagramSocket>;

/// How the destination should be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialMode {
    Stream,
    Datagram,
}

/// An opened destination.
pub enum Dialed {
    Stream(BoxedStream),
    Datagram(BoxedDatagram),
}

impl Dialed {
    /// Take the stream, failing if the dialer returned a datagram socket.
    pub fn into_stream(self) -> io::Result<BoxedStream> {
        match self {
            Dialed::Stream(stream) => Ok(stream),
            Dialed::Datagram(_) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "dialer returned a datagram socket for a stream dial",
            )),
        }
    }

    /// Take the datagram socket, failing if the dialer returned a stream.
    pub fn into_datagram(self) -> io::Result<BoxedDatagram> {
        match self {
            Dialed::Datagram(socket) => Ok(socket),
            Dialed::Stream(_) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "dialer returned a stream for a datagram dial",
            )),
        }
    }
}

/// Opens destinations on behalf of authenticated tunnels.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open `target` in the given mode.
    ///
    /// For [`DialMode::Datagram`] the target is the one named in the request
    /// header; individual datagrams carry their own destinations.
    async fn dial(&self, target: &TargetAddr, mode: DialMode) -> io::Result<Dialed>;
}

/// Dials destinations directly from this host.
#[derive(Debug, Clone)]
pub struct DirectDialer {
    connect_timeout: Duration,
}

impl DirectDialer {
    /// Create a direct dialer with the default connect timeout.
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Create a direct dialer with a custom connect timeout.
    pub fn with_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn connect(&self, target: &TargetAddr) -> io::Result<TcpStream> {
        debug!(target = %target, "Connecting to destination");

        let connect = async {
            match target {
                TargetAddr::Socket(addr) => TcpStream::connect(*addr).await,
                TargetAddr::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await,
            }
        };

        match timeout(self.connect_timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        }
    }
}

impl Default for DirectDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, target: &TargetAddr, mode: DialMode) -> io::Result<Dialed> {
        match mode {
            DialMode::Stream => {
                let stream = self.connect(target).await?;
                stream.set_nodelay(true)?;
                Ok(Dialed::Stream(Box::new(stream)))
            }
            DialMode::Datagram => {
                let socket = DirectDatagram::bind().await?;
                Ok(Dialed::Datagram(Box::new(socket)))
            }
        }
    }
}

/// UDP socket for datagram tunnels.
///
/// Prefers a dual-stack IPv6 socket so one socket reaches both families;
/// IPv4 destinations are sent to as IPv4-mapped addresses.
#[derive(Debug)]
pub struct DirectDatagram {
    socket: UdpSocket,
    dual_stack: bool,
}

impl DirectDatagram {
    /// Bind an unspecified local address.
    pub async fn bind() -> io::Result<Self> {
        match UdpSocket::bind(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)).await {
            Ok(socket) => Ok(Self {
                socket,
                dual_stack: true,
            }),
            Err(e) => {
                debug!(error = %e, "IPv6 UDP bind failed, falling back to IPv4");
                let socket =
                    UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await?;
                Ok(Self {
                    socket,
                    dual_stack: false,
                })
            }
        }
    }

    /// Local address of the socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    async fn resolve(&self, target: &TargetAddr) -> io::Result<SocketAddr> {
        let addr = match target {
            TargetAddr::Socket(addr) => *addr,
            TargetAddr::Domain(host, port) => {
                let mut candidates = lookup_host((host.as_str(), *port)).await?;
                let found = if self.dual_stack {
                    candidates.next()
                } else {
                    candidates.find(SocketAddr::is_ipv4)
                };
                found.ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no usable address for {}", target),
                    )
                })?
            }
        };

        match (addr, self.dual_stack) {
            (SocketAddr::V4(v4), true) => Ok(SocketAddr::new(
                IpAddr::V6(v4.ip().to_ipv6_mapped()),
                v4.port(),
            )),
            (SocketAddr::V6(_), false) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "IPv6 destination on an IPv4-only socket",
            )),
            (addr, _) => Ok(addr),
        }
    }
}

#[async_trait]
impl DatagramSocket for DirectDatagram {
    async fn send_to(&self, payload: &[u8], target: &TargetAddr) -> io::Result<usize> {
        let addr = self.resolve(target).await?;
        self.socket.send_to(payload, addr).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, TargetAddr)> {
        let (n, from) = self.socket.recv_from(buf).await?;
        Ok((n, TargetAddr::Socket(unmap(from))))
    }
}

/// Report IPv4-mapped IPv6 sources as plain IPv4.
fn unmap(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        v4 => v4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_unmap() {
        let mapped: SocketAddr = "[::ffff:10.0.0.1]:53".parse().unwrap();
        assert_eq!(unmap(mapped), "10.0.0.1:53".parse::<SocketAddr>().unwrap());

        let native: SocketAddr = "[2001:db8::1]:53".parse().unwrap();
        assert_eq!(unmap(native), native);
    }

    #[tokio::test]
    async fn test_direct_stream_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"hi").await.unwrap();
        });

        let dialed = DirectDialer::new()
            .dial(&TargetAddr::Socket(addr), DialMode::Stream)
            .await
            .unwrap();
        let mut stream = dialed.into_stream().unwrap();

        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_direct_stream_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = DirectDialer::new()
            .dial(&TargetAddr::Socket(addr), DialMode::Stream)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_direct_datagram_roundtrip() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..n], from).await.unwrap();
        });

        let socket = DirectDialer::new()
            .dial(&TargetAddr::Socket(echo_addr), DialMode::Datagram)
            .await
            .unwrap()
            .into_datagram()
            .unwrap();

        socket
            .send_to(b"ping", &TargetAddr::Socket(echo_addr))
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, TargetAddr::Socket(echo_addr));
    }

    #[tokio::test]
    async fn test_dialed_mode_mismatch() {
        let stream: BoxedStream = Box::new(tokio_test::io::Builder::new().build());
        assert!(Dialed::Stream(stream).into_datagram().is_err());
    }
}
