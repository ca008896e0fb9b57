//! Reliable full-transfer operations over a [`Connection`].
//!
//! The transport only promises best-effort partial reads and writes. The
//! channel turns "send these N bytes" and "receive exactly N bytes" into a
//! bounded sequence of partial operations that either completes or fails
//! definitively; callers never see a partial result.

use bytes::BytesMut;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::ChannelError;
use crate::message::Message;
use crate::transport::Connection;

/// Exact-count send/receive wrapper owning one connection.
#[derive(Debug)]
pub struct ReliableChannel<S = TcpStream> {
    conn: Connection<S>,
    io_timeout: Option<Duration>,
    bytes_sent: u64,
    bytes_received: u64,
}

impl<S> ReliableChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Take ownership of `conn`.
    pub fn new(conn: Connection<S>) -> Self {
        Self {
            conn,
            io_timeout: None,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    /// Bound every plain operation by `timeout` (`None` waits forever).
    pub fn with_io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Remote address of the owned connection
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.conn.peer_addr()
    }

    /// Total bytes the transport accepted from this channel
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Total bytes read through this channel
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Whether the owned connection has been closed
    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// Close the owned connection. Safe to call more than once.
    pub async fn close(&mut self) -> bool {
        self.conn.close().await
    }

    fn default_deadline(&self) -> Option<Instant> {
        self.io_timeout.map(|t| Instant::now() + t)
    }

    /// Send every byte of `buf`.
    pub async fn send_all(&mut self, buf: &[u8]) -> Result<(), ChannelError> {
        let deadline = self.default_deadline();
        self.send_all_until(buf, deadline).await
    }

    /// Send every byte of `buf`, failing with `TimedOut` once `deadline` passes.
    pub async fn send_all_until(
        &mut self,
        buf: &[u8],
        deadline: Option<Instant>,
    ) -> Result<(), ChannelError> {
        let expected = buf.len();
        let mut sent = 0;

        while sent < expected {
            match with_deadline(deadline, self.conn.write(&buf[sent..])).await {
                Ok(0) => {
                    return Err(ChannelError::SendFailed {
                        sent,
                        expected,
                        source: io::Error::new(
                            io::ErrorKind::WriteZero,
                            "transport accepted zero bytes",
                        ),
                    });
                }
                Ok(n) => {
                    sent += n;
                    self.bytes_sent += n as u64;
                    trace!("wrote {} bytes ({}/{})", n, sent, expected);
                }
                Err(e) if is_retryable(&e) => {
                    tokio::task::yield_now().await;
                }
                Err(source) => {
                    return Err(ChannelError::SendFailed {
                        sent,
                        expected,
                        source,
                    });
                }
            }
        }

        debug!("Sent {} bytes to {:?}", expected, self.conn.peer_addr());
        Ok(())
    }

    /// Receive exactly `n` bytes.
    pub async fn recv_all(&mut self, n: usize) -> Result<Message, ChannelError> {
        let deadline = self.default_deadline();
        self.recv_all_until(n, deadline).await
    }

    /// Receive exactly `n` bytes, failing with `TimedOut` once `deadline` passes.
    pub async fn recv_all_until(
        &mut self,
        n: usize,
        deadline: Option<Instant>,
    ) -> Result<Message, ChannelError> {
        if n == 0 {
            return Ok(Message::default());
        }

        let mut acc = BytesMut::zeroed(n);
        let mut received = 0;

        while received < n {
            match with_deadline(deadline, self.conn.read(&mut acc[received..])).await {
                Ok(0) => {
                    return Err(ChannelError::PeerClosed {
                        received,
                        expected: n,
                    });
                }
                Ok(got) => {
                    received += got;
                    self.bytes_received += got as u64;
                    trace!("read {} bytes ({}/{})", got, received, n);
                }
                Err(e) if is_retryable(&e) => {
                    tokio::task::yield_now().await;
                }
                Err(source) => {
                    return Err(ChannelError::RecvFailed {
                        received,
                        expected: n,
                        source,
                    });
                }
            }
        }

        debug!("Received {} bytes from {:?}", n, self.conn.peer_addr());
        Ok(Message::new(acc.freeze()))
    }

    /// Receive one message of unknown length, at most `max_len` bytes.
    ///
    /// The message is whatever a single successful read delivers.
    pub async fn recv_message(&mut self, max_len: usize) -> Result<Message, ChannelError> {
        let deadline = self.default_deadline();
        self.recv_message_until(max_len, deadline).await
    }

    /// [`recv_message`](Self::recv_message) with an explicit deadline.
    pub async fn recv_message_until(
        &mut self,
        max_len: usize,
        deadline: Option<Instant>,
    ) -> Result<Message, ChannelError> {
        if max_len == 0 {
            return Ok(Message::default());
        }

        let mut buf = BytesMut::zeroed(max_len);
        loop {
            match with_deadline(deadline, self.conn.read(&mut buf)).await {
                Ok(0) => {
                    return Err(ChannelError::PeerClosed {
                        received: 0,
                        expected: max_len,
                    });
                }
                Ok(got) => {
                    self.bytes_received += got as u64;
                    buf.truncate(got);
                    debug!("Received {}-byte message from {:?}", got, self.conn.peer_addr());
                    return Ok(Message::new(buf.freeze()));
                }
                Err(e) if is_retryable(&e) => {
                    tokio::task::yield_now().await;
                }
                Err(source) => {
                    return Err(ChannelError::RecvFailed {
                        received: 0,
                        expected: max_len,
                        source,
                    });
                }
            }
        }
    }
}

/// Would-block and interrupted results are retried on the same operation.
fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

async fn with_deadline<T, F>(deadline: Option<Instant>, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "deadline elapsed before transfer completed",
            )),
        },
        None => fut.await,
    }
}
