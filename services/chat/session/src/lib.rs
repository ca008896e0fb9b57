//! TCP transport, reliable send/recv, GREETING/ACK session loops and accept loop for chat.
//!
//! This crate implements a point-to-point text messaging protocol over TCP.
//! A responder greets each peer, acknowledges every message and closes when
//! it sees a terminator; an initiator waits for the greeting, then sends one
//! message at a time and waits for each acknowledgment.
//!
//! ## Features
//!
//! - **TCP Transport**: Listener with address reuse, dialer, idempotent close
//! - **Reliable Channel**: Exact-count send/receive over partial I/O
//! - **Session Lifecycle**: `Establishing → Greeting → Active → Closing → Closed`
//! - **Sequential Server**: One session at a time, peers queue in the backlog
//! - **Shutdown**: Signal handlers fire a trigger; sessions close their own sockets
//!
//! ## Example
//!
//! ```rust,no_run
//! use chat_session::{
//!     connect_tcp, Initiator, Message, SessionConfig, SessionEvent, ShutdownSignal,
//! };
//! use tokio::sync::mpsc;
//!
//! # async fn example() -> Result<(), chat_session::SessionError> {
//! let conn = connect_tcp("127.0.0.1:42999").await?;
//! let (input_tx, input_rx) = mpsc::channel(16);
//! let (event_tx, mut event_rx) = mpsc::channel(16);
//!
//! let session = Initiator::new(conn, SessionConfig::default()).with_events(event_tx);
//! let handle = tokio::spawn(session.run(input_rx, ShutdownSignal::never()));
//!
//! input_tx.send(Message::from("hello")).await.ok();
//! input_tx.send(Message::from("bye")).await.ok();
//!
//! while let Some(event) = event_rx.recv().await {
//!     if let SessionEvent::Acknowledged { text } = event {
//!         println!("Server > {}", text);
//!     }
//! }
//! let report = handle.await.expect("session task")?;
//! println!("Session ended: {}", report.reason);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod error;
pub mod initiator;
pub mod message;
pub mod responder;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod transport;

#[cfg(test)]
mod testing;

pub use channel::ReliableChannel;
pub use error::{ChannelError, SessionError};
pub use initiator::Initiator;
pub use message::{
    Message, Terminators, ACKNOWLEDGMENT, BACKLOG, BUFFER_SIZE, DEFAULT_HOST, DEFAULT_PORT,
    DEFAULT_TERMINATORS, GREETING,
};
pub use responder::Responder;
pub use server::{Server, ServerConfig, ServerStats};
pub use session::{CloseReason, SessionConfig, SessionEvent, SessionReport, SessionState, SessionStats};
pub use shutdown::{ShutdownSignal, ShutdownTrigger};
pub use transport::{connect_tcp, listen_tcp, Acceptor, Connection, TcpConnection};
