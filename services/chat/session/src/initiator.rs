//! Initiator (client-side) session loop.
//!
//! The initiator waits for the greeting, then sends each line from its input
//! and waits for the acknowledgment before sending the next. Greeting and
//! acknowledgment lengths are known up front, so both are read with
//! [`ReliableChannel::recv_all`].

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::channel::ReliableChannel;
use crate::error::SessionError;
use crate::message::Message;
use crate::responder::cancellable;
use crate::session::{
    CloseReason, EventSink, Lifecycle, SessionConfig, SessionEvent, SessionReport, SessionState,
    SessionStats,
};
use crate::shutdown::ShutdownSignal;
use crate::transport::Connection;

/// Drives one outbound connection.
pub struct Initiator<S = TcpStream> {
    channel: ReliableChannel<S>,
    config: SessionConfig,
    lifecycle: Lifecycle,
    stats: SessionStats,
    events: EventSink,
}

impl<S> Initiator<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Take ownership of a connected stream
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

    /// Report greeting and acknowledgments on `tx`
    pub fn with_events(mut self, tx: mpsc::Sender<SessionEvent>) -> Self {
        self.events = EventSink::new(Some(tx));
        self
    }

    /// Run until a terminator is entered, `input` closes, or the exchange fails.
    ///
    /// Each item of `input` is one message, sent as raw bytes. Empty items
    /// are skipped, as are items longer than the configured buffer size.
    pub async fn run(
        mut self,
        mut input: mpsc::Receiver<Message>,
        mut shutdown: ShutdownSignal,
    ) -> Result<SessionReport, SessionError> {
        let peer = self.channel.peer_addr();
        info!("Starting initiator session with {:?}", peer);
        self.events.emit(SessionEvent::Connected { peer }).await;

        let outcome = self.exchange(&mut input, &mut shutdown).await;
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

    async fn exchange(
        &mut self,
        input: &mut mpsc::Receiver<Message>,
        shutdown: &mut ShutdownSignal,
    ) -> Result<CloseReason, SessionError> {
        let peer = self.channel.peer_addr();
        self.lifecycle.enter(SessionState::Greeting, &self.events).await;
        let expected = self.config.greeting.len();
        let greeting = cancellable(shutdown, self.channel.recv_all(expected)).await?;
        self.stats.messages_in += 1;
        if greeting != self.config.greeting {
            warn!("Unexpected greeting from server: {:?}", greeting.text());
        }
        debug!("Greeting received from {:?}", peer);
        self.events
            .emit(SessionEvent::GreetingReceived {
                text: greeting.text().into_owned(),
            })
            .await;
        self.lifecycle.enter(SessionState::Active, &self.events).await;

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.triggered() => return Err(SessionError::Cancelled),
                next = input.recv() => next,
            };
            let Some(message) = next else {
                info!("Input closed, ending session");
                return Ok(CloseReason::InputExhausted);
            };

            let text = message.text().into_owned();
            if text.is_empty() {
                debug!("Skipping empty message");
                continue;
            }
            if message.len() > self.config.buffer_size {
                warn!(
                    "Message of {} bytes exceeds the {} byte limit, not sent",
                    message.len(),
                    self.config.buffer_size
                );
                continue;
            }

            if self.config.terminators.matches(&message) {
                if self.config.announce_terminator {
                    cancellable(shutdown, self.channel.send_all(message.as_bytes())).await?;
                    self.stats.messages_out += 1;
                }
                info!("Terminator {:?} entered, closing connection", text);
                return Ok(CloseReason::Terminator(text));
            }

            cancellable(shutdown, self.channel.send_all(message.as_bytes())).await?;
            self.stats.messages_out += 1;

            let expected = self.config.acknowledgment.len();
            let ack = cancellable(shutdown, self.channel.recv_all(expected)).await?;
            self.stats.messages_in += 1;
            if ack != self.config.acknowledgment {
                warn!("Unexpected acknowledgment from server: {:?}", ack.text());
            }
            debug!("Acknowledgment received ({} bytes)", ack.len());
            self.events
                .emit(SessionEvent::Acknowledged {
                    text: ack.text().into_owned(),
                })
                .await;
        }
    }
}
