//! Session lifecycle shared by the responder and initiator loops.
//!
//! A session owns one connection from `Establishing` until `Closed`. Orderly
//! endings pass through `Closing`; transfer failures and cancellation jump
//! straight to `Closed`. Either way `Closed` is entered exactly once.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::message::{Message, Terminators, ACKNOWLEDGMENT, BUFFER_SIZE, GREETING};

/// Configuration shared by both session roles
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Largest message accepted or sent, in bytes
    pub buffer_size: usize,
    /// Texts that end the session
    pub terminators: Terminators,
    /// First message from the responder
    pub greeting: Message,
    /// Responder reply to every non-terminator message
    pub acknowledgment: Message,
    /// Deadline applied to each send/receive (`None` waits forever)
    pub io_timeout: Option<Duration>,
    /// Initiator only: transmit the terminator before closing
    pub announce_terminator: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_size: BUFFER_SIZE,
            terminators: Terminators::default(),
            greeting: Message::from(GREETING),
            acknowledgment: Message::from(ACKNOWLEDGMENT),
            io_timeout: None,
            announce_terminator: true,
        }
    }
}

/// Lifecycle states of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connection handed in, nothing exchanged yet
    Establishing,
    /// Greeting being sent (responder) or awaited (initiator)
    Greeting,
    /// Message round-trips in progress
    Active,
    /// Orderly end, releasing the connection
    Closing,
    /// Terminal
    Closed,
}

impl SessionState {
    /// Whether `self -> next` is a legal transition
    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Establishing, Greeting)
                | (Greeting, Active)
                | (Active, Closing)
                | (Closing, Closed)
                | (Establishing, Closed)
                | (Greeting, Closed)
                | (Active, Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Establishing => "establishing",
            SessionState::Greeting => "greeting",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Tracks the current state and refuses illegal transitions.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: SessionState,
    peer: Option<SocketAddr>,
}

impl Lifecycle {
    pub(crate) fn new(peer: Option<SocketAddr>) -> Self {
        Self {
            state: SessionState::Establishing,
            peer,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`; returns `false` and stays put if the move is illegal.
    pub(crate) fn advance(&mut self, next: SessionState) -> bool {
        if !self.state.can_advance_to(next) {
            warn!(
                "Ignoring illegal session transition {} -> {} (peer {:?})",
                self.state, next, self.peer
            );
            return false;
        }
        debug!("Session {:?}: {} -> {}", self.peer, self.state, next);
        self.state = next;
        true
    }

    /// [`advance`](Self::advance), reporting a successful move on `events`.
    pub(crate) async fn enter(&mut self, next: SessionState, events: &EventSink) -> bool {
        let from = self.state;
        if !self.advance(next) {
            return false;
        }
        events
            .emit(SessionEvent::StateChanged {
                peer: self.peer,
                from,
                to: next,
            })
            .await;
        true
    }
}

/// Statistics for a session
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Messages received
    pub messages_in: u64,
    /// Messages sent, greeting and acknowledgments included
    pub messages_out: u64,
    /// Total bytes received
    pub bytes_in: u64,
    /// Total bytes sent
    pub bytes_out: u64,
}

/// Why a session ended in an orderly way
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// A terminator message was exchanged
    Terminator(String),
    /// The peer closed its side of the stream
    PeerClosed,
    /// The local input source ran dry (initiator)
    InputExhausted,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Terminator(text) => write!(f, "terminator {:?}", text),
            CloseReason::PeerClosed => f.write_str("peer closed the connection"),
            CloseReason::InputExhausted => f.write_str("input closed"),
        }
    }
}

/// Summary of a session that ended in an orderly way
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionReport {
    /// Remote address, when known
    pub peer: Option<SocketAddr>,
    /// Why the session ended
    pub reason: CloseReason,
    /// Traffic counters
    pub stats: SessionStats,
}

/// Events emitted by sessions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Connection handed to a session
    Connected {
        /// Peer socket address
        peer: Option<SocketAddr>,
    },
    /// Initiator received the responder greeting
    GreetingReceived {
        /// Display text of the greeting
        text: String,
    },
    /// Responder received a message
    MessageReceived {
        /// Peer socket address
        peer: Option<SocketAddr>,
        /// Display text of the message
        text: String,
    },
    /// Session moved to a new lifecycle state
    StateChanged {
        /// Peer socket address
        peer: Option<SocketAddr>,
        /// State left
        from: SessionState,
        /// State entered
        to: SessionState,
    },
    /// Initiator received the acknowledgment for its last message
    Acknowledged {
        /// Display text of the acknowledgment
        text: String,
    },
    /// Session reached `Closed`
    Disconnected {
        /// Peer socket address
        peer: Option<SocketAddr>,
        /// Final counters
        stats: SessionStats,
    },
}

/// Optional event sink; a dropped receiver is not an error.
#[derive(Clone, Debug, Default)]
pub(crate) struct EventSink(Option<mpsc::Sender<SessionEvent>>);

impl EventSink {
    pub(crate) fn new(tx: Option<mpsc::Sender<SessionEvent>>) -> Self {
        Self(tx)
    }

    pub(crate) async fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.0 {
            tx.send(event).await.ok();
        }
    }
}
