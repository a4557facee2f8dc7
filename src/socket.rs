//! Ownership wrapper around one non-blocking OS socket.
//!
//! A [`Socket`] is always non-blocking: reads and writes that cannot make
//! progress return [`SocketError::Io`] with `WouldBlock`, which
//! [`AsyncSocket`](crate::AsyncSocket) turns into a suspension on the pool.
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{self as sys, IpAddr, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};

use crate::error::{Result, SocketError};

/// Address of a socket endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip4 { address: String, port: u16 },
    Ip6 { address: String, port: u16 },
    /// Filesystem path of a Unix-domain socket; empty for unnamed sockets.
    Unix(String),
}

impl Address {
    pub fn unix(path: impl Into<String>) -> Self {
        Address::Unix(path.into())
    }

    pub fn loopback(port: u16) -> Self {
        Address::Ip4 { address: "127.0.0.1".to_string(), port }
    }

    /// The IP literal or Unix path, without the port.
    pub fn host(&self) -> &str {
        match self {
            Address::Ip4 { address, .. } | Address::Ip6 { address, .. } => address,
            Address::Unix(path) => path,
        }
    }

    fn to_socket_addr(&self) -> Result<SocketAddr> {
        match self {
            Address::Ip4 { address, port } | Address::Ip6 { address, port } => {
                let ip: IpAddr = address
                    .parse()
                    .map_err(|_| SocketError::Unsupported("address is not an IP literal"))?;
                Ok(SocketAddr::new(ip, *port))
            }
            Address::Unix(_) => Err(SocketError::Unsupported("unix address has no IP form")),
        }
    }

    fn from_unix(addr: &mio::net::SocketAddr) -> Self {
        let path = addr
            .as_pathname()
            .map(|path| path.to_string_lossy().into_owned())
            .unwrap_or_default();
        Address::Unix(path)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Address::Ip4 { address: v4.ip().to_string(), port: v4.port() },
            SocketAddr::V6(v6) => Address::Ip6 { address: v6.ip().to_string(), port: v6.port() },
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip4 { address, port } => write!(f, "{}:{}", address, port),
            Address::Ip6 { address, port } => write!(f, "[{}]:{}", address, port),
            Address::Unix(path) => write!(f, "unix:{}", path),
        }
    }
}

enum Kind {
    TcpStream(mio::net::TcpStream),
    TcpListener(mio::net::TcpListener),
    UnixStream(mio::net::UnixStream),
    UnixListener(mio::net::UnixListener),
}

/// A non-blocking stream or listening socket.
///
/// The descriptor is released by [`close`](Socket::close) or on drop; every
/// operation after close fails with [`SocketError::Disconnected`].
pub struct Socket {
    kind: Option<Kind>,
}

impl Socket {
    fn new(kind: Kind) -> Self {
        Socket { kind: Some(kind) }
    }

    /// Binds `address` and starts listening on it.
    pub fn listen(address: &Address) -> Result<Socket> {
        let kind = match address {
            Address::Unix(path) => Kind::UnixListener(mio::net::UnixListener::bind(path)?),
            _ => Kind::TcpListener(mio::net::TcpListener::bind(address.to_socket_addr()?)?),
        };
        Ok(Socket::new(kind))
    }

    /// Starts a non-blocking connect; the socket becomes writable once connected.
    pub fn connect(address: &Address) -> Result<Socket> {
        let kind = match address {
            Address::Unix(path) => Kind::UnixStream(mio::net::UnixStream::connect(path)?),
            _ => Kind::TcpStream(mio::net::TcpStream::connect(address.to_socket_addr()?)?),
        };
        Ok(Socket::new(kind))
    }

    /// Creates a connected pair of Unix-domain stream sockets.
    pub fn pair() -> Result<(Socket, Socket)> {
        let (a, b) = mio::net::UnixStream::pair()?;
        Ok((Socket::new(Kind::UnixStream(a)), Socket::new(Kind::UnixStream(b))))
    }

    /// Adopts a connected std TCP stream, switching it to non-blocking mode.
    pub fn from_tcp(stream: sys::TcpStream) -> Result<Socket> {
        stream.set_nonblocking(true)?;
        Ok(Socket::new(Kind::TcpStream(mio::net::TcpStream::from_std(stream))))
    }

    fn kind(&self) -> Result<&Kind> {
        self.kind.as_ref().ok_or(SocketError::Disconnected)
    }

    pub fn is_closed(&self) -> bool {
        self.kind.is_none()
    }

    pub fn is_listener(&self) -> bool {
        matches!(self.kind, Some(Kind::TcpListener(_)) | Some(Kind::UnixListener(_)))
    }

    pub fn raw_fd(&self) -> Result<RawFd> {
        Ok(match self.kind()? {
            Kind::TcpStream(s) => s.as_raw_fd(),
            Kind::TcpListener(s) => s.as_raw_fd(),
            Kind::UnixStream(s) => s.as_raw_fd(),
            Kind::UnixListener(s) => s.as_raw_fd(),
        })
    }

    /// Accepts one pending connection.
    pub fn accept(&self) -> Result<Socket> {
        match self.kind()? {
            Kind::TcpListener(listener) => {
                let (stream, _) = listener.accept()?;
                Ok(Socket::new(Kind::TcpStream(stream)))
            }
            Kind::UnixListener(listener) => {
                let (stream, _) = listener.accept()?;
                Ok(Socket::new(Kind::UnixStream(stream)))
            }
            _ => Err(SocketError::Unsupported("accept on a stream socket")),
        }
    }

    /// Reads into `buf`. An orderly shutdown by the peer is reported as
    /// [`SocketError::Disconnected`].
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let read = match self.kind()? {
            Kind::TcpStream(s) => (&*s).read(buf)?,
            Kind::UnixStream(s) => (&*s).read(buf)?,
            _ => return Err(SocketError::Unsupported("read on a listening socket")),
        };

        if read == 0 && !buf.is_empty() {
            return Err(SocketError::Disconnected);
        }
        Ok(read)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        match self.kind()? {
            Kind::TcpStream(s) => Ok((&*s).write(buf)?),
            Kind::UnixStream(s) => Ok((&*s).write(buf)?),
            _ => Err(SocketError::Unsupported("write on a listening socket")),
        }
    }

    /// Returns and clears the pending socket error, used to finish a connect.
    pub fn take_error(&self) -> Result<Option<io::Error>> {
        Ok(match self.kind()? {
            Kind::TcpStream(s) => s.take_error()?,
            Kind::TcpListener(s) => s.take_error()?,
            Kind::UnixStream(s) => s.take_error()?,
            Kind::UnixListener(s) => s.take_error()?,
        })
    }

    pub fn local_address(&self) -> Result<Address> {
        Ok(match self.kind()? {
            Kind::TcpStream(s) => s.local_addr()?.into(),
            Kind::TcpListener(s) => s.local_addr()?.into(),
            Kind::UnixStream(s) => Address::from_unix(&s.local_addr()?),
            Kind::UnixListener(s) => Address::from_unix(&s.local_addr()?),
        })
    }

    pub fn peer_address(&self) -> Result<Address> {
        match self.kind()? {
            Kind::TcpStream(s) => Ok(s.peer_addr()?.into()),
            Kind::UnixStream(s) => Ok(Address::from_unix(&s.peer_addr()?)),
            _ => Err(SocketError::Unsupported("listening sockets have no peer")),
        }
    }

    /// Releases the descriptor. Closing twice is a no-op.
    pub fn close(&mut self) {
        self.kind.take();
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            Some(Kind::TcpStream(_)) => "tcp-stream",
            Some(Kind::TcpListener(_)) => "tcp-listener",
            Some(Kind::UnixStream(_)) => "unix-stream",
            Some(Kind::UnixListener(_)) => "unix-listener",
            None => "closed",
        };
        f.debug_struct("Socket").field("kind", &kind).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that a socket pair carries bytes in both directions.
    #[test]
    fn test_pair_read_write() {
        let (a, b) = Socket::pair().unwrap();
        assert_eq!(a.write(b"ping").unwrap(), 4);

        let mut buf = [0u8; 8];
        let n = b.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    /// Tests that reads on an empty socket do not block.
    #[test]
    fn test_nonblocking_read() {
        let (a, _b) = Socket::pair().unwrap();
        let mut buf = [0u8; 8];
        let err = a.read(&mut buf).unwrap_err();
        assert!(err.is_would_block());
    }

    /// Tests that an orderly peer close reads as `Disconnected`.
    #[test]
    fn test_peer_close_is_disconnect() {
        let (a, mut b) = Socket::pair().unwrap();
        b.close();
        let mut buf = [0u8; 8];
        assert!(a.read(&mut buf).unwrap_err().is_disconnect());
    }

    /// Tests that every operation fails once the socket is closed.
    #[test]
    fn test_closed_socket_fails() {
        let (mut a, _b) = Socket::pair().unwrap();
        a.close();
        a.close();
        assert!(a.is_closed());
        assert!(a.write(b"x").unwrap_err().is_disconnect());
        assert!(a.raw_fd().unwrap_err().is_disconnect());
        assert!(a.local_address().unwrap_err().is_disconnect());
    }

    #[test]
    fn test_tcp_listener_address() {
        let listener = Socket::listen(&Address::loopback(0)).unwrap();
        assert!(listener.is_listener());
        match listener.local_address().unwrap() {
            Address::Ip4 { address, port } => {
                assert_eq!(address, "127.0.0.1");
                assert_ne!(port, 0);
            }
            other => panic!("unexpected address {:?}", other),
        }
        assert!(listener.peer_address().is_err());
    }

    #[test]
    fn test_unix_listener_address() {
        let path = std::env::temp_dir().join(format!("tern-socket-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let path = path.to_string_lossy().into_owned();

        let listener = Socket::listen(&Address::unix(path.clone())).unwrap();
        assert_eq!(listener.local_address().unwrap(), Address::unix(path.clone()));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_address_display() {
        assert_eq!(Address::loopback(80).to_string(), "127.0.0.1:80");
        let v6 = Address::from("[::1]:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(v6.to_string(), "[::1]:8080");
        assert_eq!(v6.host(), "::1");
        assert_eq!(Address::unix("/tmp/a").to_string(), "unix:/tmp/a");
    }
}
