//! Responder (server-side) session loop.
//!
//! ```text
//! Establishing ─▶ Greeting ──send greeting──▶ Active ◀─┐
//!                    │                          │      │ message / ack
//!                    │ SendFailed               ├──────┘
//!                    ▼                          │ terminator, PeerClosed
//!                  Closed ◀──── Closing ◀───────┘
//!                    ▲                          │ RecvFailed, SendFailed,
//!                    └──────────────────────────┘ shutdown
//! ```

use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::channel::ReliableChannel;
use crate::error::{ChannelError, SessionError};
use crate::message::Message;
use crate::session::{
    CloseReason, EventSink, Lifecycle, SessionConfig, SessionEvent, SessionReport, SessionState,
    SessionStats,
};
use crate::shutdown::ShutdownSignal;
use crate::transport::Connection;

/// Serves one accepted connection until it closes.
pub struct Responder<S = TcpStream> {
    channel: ReliableChannel<S>,
    config: SessionConfig,
    lifecycle: Lifecycle,
    stats: SessionStats,
    events: EventSink,
}

impl<S> Responder<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Take ownership of an accepted connection
    pub fn new(conn: Connection<S>, config: SessionConfig) -> Self {
        let peer = conn.peer_addr();
        let channel = ReliableChannel::new(conn).with_io_timeout(config.io_timeout);
        Self {
            channel,
            config,
            lifecycle: Lifecycle::new(peer),
            stats: SessionStats::default(),
            events: EventSink::default(),
        }
    }

    /// Report progress on `tx`
    pub fn with_events(self, tx: mpsc::Sender<SessionEvent>) -> Self {
        self.with_sink(EventSink::new(Some(tx)))
    }

    pub(crate) fn with_sink(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Drive the session to `Closed`.
    ///
    /// The connection is closed on every path. `Ok` means an orderly end
    /// (terminator or peer hang-up); transfer failures and shutdown are
    /// returned as errors.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) -> Result<SessionReport, SessionError> {
        let peer = self.channel.peer_addr();
        info!("Starting responder session with {:?}", peer);
        self.events.emit(SessionEvent::Connected { peer }).await;

        let outcome = self.exchange(&mut shutdown).await;
        match &outcome {
            Ok(reason) => {
                debug!("Closing session with {:?}: {}", peer, reason);
                self.lifecycle.enter(SessionState::Closing, &self.events).await;
            }
            Err(SessionError::Cancelled) => info!("Session with {:?} cancelled by shutdown", peer),
            Err(e) => error!("Session with {:?} failed: {}", peer, e),
        }

        self.channel.close().await;
        self.lifecycle.enter(SessionState::Closed, &self.events).await;

        self.stats.bytes_in = self.channel.bytes_received();
        self.stats.bytes_out = self.channel.bytes_sent();
        info!(
            "Session with {:?} {}. Stats: {:?}",
            peer,
            self.lifecycle.state(),
            self.stats
        );
        self.events
            .emit(SessionEvent::Disconnected {
                peer,
                stats: self.stats.clone(),
            })
            .await;

        outcome.map(|reason| SessionReport {
            peer,
            reason,
            stats: self.stats,
        })
    }

    async fn exchange(&mut self, shutdown: &mut ShutdownSignal) -> Result<CloseReason, SessionError> {
        let peer = self.channel.peer_addr();

        self.lifecycle.enter(SessionState::Greeting, &self.events).await;
        let greeting = self.config.greeting.clone();
        self.send(&greeting, shutdown).await?;
        debug!("Sent greeting to {:?}", peer);
        self.lifecycle.enter(SessionState::Active, &self.events).await;

        loop {
            let received = cancellable(shutdown, self.channel.recv_message(self.config.buffer_size)).await;
            let message = match received {
                Ok(message) => message,
                Err(SessionError::Channel(e)) if e.is_peer_closed() => {
                    info!("Client {:?} disconnected.", peer);
                    return Ok(CloseReason::PeerClosed);
                }
                Err(e) => return Err(e),
            };

            self.stats.messages_in += 1;
            let text = message.text().into_owned();
            debug!("Received {:?} from {:?}", text, peer);
            self.events
                .emit(SessionEvent::MessageReceived {
                    peer,
                    text: text.clone(),
                })
                .await;

            if self.config.terminators.matches(&message) {
                info!("Client {:?} ended the session with {:?}", peer, text);
                return Ok(CloseReason::Terminator(text));
            }

            let ack = self.config.acknowledgment.clone();
            self.send(&ack, shutdown).await?;
        }
    }

    async fn send(&mut self, message: &Message, shutdown: &mut ShutdownSignal) -> Result<(), SessionError> {
        cancellable(shutdown, self.channel.send_all(message.as_bytes())).await?;
        self.stats.messages_out += 1;
        Ok(())
    }
}

/// Run a channel operation unless shutdown fires first.
pub(crate) async fn cancellable<T, F>(
    shutdown: &mut ShutdownSignal,
    op: F,
) -> Result<T, SessionError>
where
    F: Future<Output = Result<T, ChannelError>>,
{
    tokio::select! {
        biased;
        _ = shutdown.triggered() => Err(SessionError::Cancelled),
        result = op => result.map_err(SessionError::from),
    }
}
