//! TCP transport for chat sessions.
//!
//! This module provides the [`Connection`] handle owned by a session, the
//! listening [`Acceptor`], and the dialer. Socket shutdown semantics are
//! hidden behind [`Connection::close`].

use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, info, warn};

use crate::error::SessionError;

/// Exclusive handle to one duplex byte stream.
///
/// After [`close`](Connection::close) every read and write fails with
/// [`io::ErrorKind::NotConnected`]; closing again does nothing.
#[derive(Debug)]
pub struct Connection<S = TcpStream> {
    stream: Option<S>,
    peer: Option<SocketAddr>,
}

/// Connection over a plain TCP stream
pub type TcpConnection = Connection<TcpStream>;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already connected stream
    pub fn new(stream: S, peer: Option<SocketAddr>) -> Self {
        Self {
            stream: Some(stream),
            peer,
        }
    }

    /// Remote address, when known
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Underlying stream, `None` once closed
    pub fn get_ref(&self) -> Option<&S> {
        self.stream.as_ref()
    }

    /// Whether `close` has already run
    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Write some prefix of `buf`, returning how many bytes the transport took.
    pub async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stream.as_mut() {
            Some(stream) => stream.write(buf).await,
            None => Err(not_connected()),
        }
    }

    /// Read up to `buf.len()` bytes. `Ok(0)` means the peer closed its side.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.as_mut() {
            Some(stream) => stream.read(buf).await,
            None => Err(not_connected()),
        }
    }

    /// Shut down and release the stream.
    ///
    /// Returns `true` if this call closed the connection, `false` if it was
    /// already closed.
    pub async fn close(&mut self) -> bool {
        let Some(mut stream) = self.stream.take() else {
            return false;
        };

        if let Err(e) = stream.shutdown().await {
            // Peer may already be gone; the stream is dropped either way.
            debug!("Shutdown of connection to {:?} reported: {}", self.peer, e);
        }
        debug!("Connection to {:?} closed", self.peer);
        true
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection already closed")
}

/// Listening socket handing out [`TcpConnection`]s.
#[derive(Debug)]
pub struct Acceptor {
    listener: tokio::net::TcpListener,
    local_addr: SocketAddr,
}

impl Acceptor {
    /// Address the listener is bound to (with the OS-assigned port, if any)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next peer.
    ///
    /// Accepts interrupted by a signal are retried here and never surface.
    pub async fn accept(&self) -> io::Result<TcpConnection> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => return Ok(Connection::new(stream, Some(peer))),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    debug!("accept interrupted, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Create a TCP listener bound to `addr` with address reuse enabled
pub fn listen_tcp(addr: SocketAddr, backlog: u32) -> Result<Acceptor, SessionError> {
    let setup = |e: io::Error| SessionError::setup(addr.to_string(), e);

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(setup)?;

    if let Err(e) = socket.set_reuseaddr(true) {
        warn!("Could not enable SO_REUSEADDR on {}: {}", addr, e);
        return Err(setup(e));
    }
    socket.bind(addr).map_err(setup)?;
    let listener = socket.listen(backlog).map_err(setup)?;
    let local_addr = listener.local_addr().map_err(setup)?;

    info!("Listening on {} (backlog {})", local_addr, backlog);
    Ok(Acceptor {
        listener,
        local_addr,
    })
}

/// Connect to a TCP address (`host:port`)
pub async fn connect_tcp(addr: &str) -> Result<TcpConnection, SessionError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| SessionError::setup(addr, e))?;
    let peer = stream.peer_addr().ok();
    info!("Connected to {}", peer.map(|p| p.to_string()).unwrap_or_else(|| addr.to_string()));
    Ok(Connection::new(stream, peer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn loopback() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    #[tokio::test]
    async fn test_tcp_listen_connect() {
        let acceptor = listen_tcp(loopback(), 2).unwrap();
        let bound_addr = acceptor.local_addr();

        let client = connect_tcp(&bound_addr.to_string()).await.unwrap();
        let server = acceptor.accept().await.unwrap();

        assert_eq!(client.peer_addr(), Some(bound_addr));
        assert!(server.peer_addr().is_some());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (a, _b) = tokio::io::duplex(64);
        let mut conn = Connection::new(a, None);

        assert!(!conn.is_closed());
        assert!(conn.close().await);
        assert!(conn.is_closed());
        assert!(!conn.close().await);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_io_after_close_is_not_connected() {
        let (a, _b) = tokio::io::duplex(64);
        let mut conn = Connection::new(a, None);
        conn.close().await;

        let err = conn.write(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        let mut buf = [0u8; 4];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_close_signals_eof_to_peer() {
        let (a, b) = tokio::io::duplex(64);
        let mut left = Connection::new(a, None);
        let mut right = Connection::new(b, None);

        left.close().await;
        let mut buf = [0u8; 8];
        assert_eq!(right.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connect_refused_is_setup_failure() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let acceptor = listen_tcp(loopback(), 1).unwrap();
            acceptor.local_addr().port()
        };
        let err = connect_tcp(&format!("127.0.0.1:{}", port)).await.unwrap_err();
        assert!(matches!(err, SessionError::TransportSetupFailed { .. }));
    }

    #[tokio::test]
    async fn test_bind_conflict_is_setup_failure() {
        let first = listen_tcp(loopback(), 1).unwrap();
        // SO_REUSEADDR does not allow two active listeners on one port.
        let err = listen_tcp(first.local_addr(), 1).unwrap_err();
        assert!(matches!(err, SessionError::TransportSetupFailed { .. }));
    }
}
