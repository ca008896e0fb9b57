//! Error types for chat sessions.

use std::io;
use thiserror::Error;

/// Failures of a single reliable transfer on an established connection.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The transport rejected a write or could not make progress.
    ///
    /// Bytes counted in `sent` were accepted by the transport and are
    /// considered delivered.
    #[error("send failed after {sent} of {expected} bytes: {source}")]
    SendFailed {
        /// Bytes accepted before the failure
        sent: usize,
        /// Bytes the caller asked to send
        expected: usize,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// A read failed with an I/O error.
    #[error("receive failed after {received} of {expected} bytes: {source}")]
    RecvFailed {
        /// Bytes accumulated before the failure
        received: usize,
        /// Bytes the caller asked for
        expected: usize,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// The peer closed its side of the stream (zero-byte read).
    #[error("peer closed the connection after {received} of {expected} bytes")]
    PeerClosed {
        /// Bytes accumulated before end of stream
        received: usize,
        /// Bytes the caller asked for
        expected: usize,
    },
}

impl ChannelError {
    /// Whether this is an orderly close by the peer rather than an I/O failure.
    pub fn is_peer_closed(&self) -> bool {
        matches!(self, ChannelError::PeerClosed { .. })
    }

    /// Kind of the underlying I/O error, if any.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            ChannelError::SendFailed { source, .. } | ChannelError::RecvFailed { source, .. } => {
                Some(source.kind())
            }
            ChannelError::PeerClosed { .. } => None,
        }
    }
}

/// Session-level errors.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Socket creation, bind, listen or connect failed.
    #[error("transport setup failed for {addr}: {source}")]
    TransportSetupFailed {
        /// Address being bound or dialed
        addr: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Mid-session transfer failure.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The session was interrupted by a shutdown request.
    #[error("session cancelled by shutdown")]
    Cancelled,
}

impl SessionError {
    pub(crate) fn setup(addr: impl Into<String>, source: io::Error) -> Self {
        SessionError::TransportSetupFailed {
            addr: addr.into(),
            source,
        }
    }
}
