//! Sequential accept loop.
//!
//! One session is served at a time. While it runs, further peers wait in the
//! listen backlog; they are accepted once the current session reaches
//! `Closed`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::error::SessionError;
use crate::message::{BACKLOG, DEFAULT_PORT};
use crate::responder::Responder;
use crate::session::{EventSink, SessionConfig, SessionEvent};
use crate::shutdown::ShutdownSignal;
use crate::transport::{listen_tcp, Acceptor};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Listener configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to bind, all interfaces by default
    pub listen: SocketAddr,
    /// Pending-connection queue length
    pub backlog: u32,
    /// Applied to every accepted session
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            backlog: BACKLOG,
            session: SessionConfig::default(),
        }
    }
}

/// Counters reported when the accept loop stops
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Sessions that ended in an orderly way
    pub sessions_completed: u64,
    /// Sessions that ended with a transfer error
    pub sessions_failed: u64,
    /// Failed accepts (the loop kept going)
    pub accept_errors: u64,
}

/// Accepts peers one after another and runs a [`Responder`] for each.
pub struct Server {
    acceptor: Acceptor,
    config: ServerConfig,
    events: EventSink,
}

impl Server {
    /// Bind the listening socket
    pub fn bind(config: &ServerConfig) -> Result<Self, SessionError> {
        let acceptor = listen_tcp(config.listen, config.backlog)?;
        Ok(Self::from_acceptor(acceptor, config.clone()))
    }

    /// Serve on an already bound acceptor
    pub fn from_acceptor(acceptor: Acceptor, config: ServerConfig) -> Self {
        Self {
            acceptor,
            config,
            events: EventSink::default(),
        }
    }

    /// Bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    /// Forward every session's events to `tx`
    pub fn with_events(mut self, tx: mpsc::Sender<SessionEvent>) -> Self {
        self.events = EventSink::new(Some(tx));
        self
    }

    /// Accept and serve until `shutdown` fires.
    ///
    /// A failed session or accept is logged and the loop continues. A
    /// session in progress when shutdown fires is cancelled and its
    /// connection closed before this returns.
    pub async fn run(self, mut shutdown: ShutdownSignal) -> ServerStats {
        let mut stats = ServerStats::default();
        info!("Server listening on {}", self.local_addr());

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                accepted = self.acceptor.accept() => accepted,
            };

            let conn = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    stats.accept_errors += 1;
                    warn!("Accept error: {}; retrying", e);
                    tokio::select! {
                        biased;
                        _ = shutdown.triggered() => break,
                        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => continue,
                    }
                }
            };

            match conn.peer_addr() {
                Some(peer) => info!("Connected by {}", peer),
                None => info!("Connected by unknown peer"),
            }

            let responder = Responder::new(conn, self.config.session.clone())
                .with_sink(self.events.clone());
            match responder.run(shutdown.clone()).await {
                Ok(report) => {
                    stats.sessions_completed += 1;
                    info!("Session with {:?} closed: {}", report.peer, report.reason);
                }
                Err(SessionError::Cancelled) => break,
                Err(e) => {
                    stats.sessions_failed += 1;
                    error!("Session failed: {}", e);
                }
            }
        }

        info!("Shutting down server...");
        info!("Server stopped. Stats: {:?}", stats);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ReliableChannel;
    use crate::message::{Message, ACKNOWLEDGMENT, GREETING};
    use crate::transport::connect_tcp;
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    fn loopback_config() -> ServerConfig {
        ServerConfig {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            ..ServerConfig::default()
        }
    }

    async fn client(addr: SocketAddr) -> ReliableChannel<TcpStream> {
        let conn = connect_tcp(&addr.to_string()).await.unwrap();
        ReliableChannel::new(conn)
    }

    async fn greet(ch: &mut ReliableChannel<TcpStream>) {
        let greeting = ch.recv_all(GREETING.len()).await.unwrap();
        assert_eq!(greeting, Message::from(GREETING));
    }

    async fn say(ch: &mut ReliableChannel<TcpStream>, text: &str) {
        ch.send_all(text.as_bytes()).await.unwrap();
        let ack = ch.recv_all(ACKNOWLEDGMENT.len()).await.unwrap();
        assert_eq!(ack, Message::from(ACKNOWLEDGMENT));
    }

    #[test]
    fn test_default_listens_on_all_interfaces() {
        let config = ServerConfig::default();
        assert_eq!(config.listen.to_string(), "0.0.0.0:42999");
        assert_eq!(config.backlog, 2);
    }

    #[tokio::test]
    async fn test_serves_clients_one_after_another() {
        let server = Server::bind(&loopback_config()).unwrap();
        let addr = server.local_addr();
        let (tx, mut rx) = mpsc::channel(64);
        let (trigger, signal) = ShutdownSignal::new();
        let handle = tokio::spawn(server.with_events(tx).run(signal));

        let mut first = client(addr).await;
        greet(&mut first).await;
        say(&mut first, "hello").await;
        first.send_all(b"bye").await.unwrap();
        assert!(first.recv_message(64).await.unwrap_err().is_peer_closed());

        // Second client hangs up without a terminator.
        let mut second = client(addr).await;
        greet(&mut second).await;
        say(&mut second, "again").await;
        second.close().await;

        // Third client is served after the abrupt disconnect.
        let mut third = client(addr).await;
        greet(&mut third).await;
        third.send_all(b"exit").await.unwrap();
        assert!(third.recv_message(64).await.unwrap_err().is_peer_closed());

        trigger.trigger();
        let stats = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(stats.sessions_completed, 3);
        assert_eq!(stats.sessions_failed, 0);

        let mut received = Vec::new();
        while let Ok(Some(event)) = timeout(Duration::from_millis(200), rx.recv()).await {
            if let SessionEvent::MessageReceived { text, .. } = event {
                received.push(text);
            }
        }
        assert_eq!(received, vec!["hello", "bye", "again", "exit"]);
    }

    #[tokio::test]
    async fn test_initiator_against_server_over_loopback() {
        let server = Server::bind(&loopback_config()).unwrap();
        let addr = server.local_addr();
        let (tx, mut rx) = mpsc::channel(64);
        let (trigger, signal) = ShutdownSignal::new();
        let handle = tokio::spawn(server.with_events(tx).run(signal));

        let conn = connect_tcp(&addr.to_string()).await.unwrap();
        let (input_tx, input_rx) = mpsc::channel(2);
        input_tx.send(Message::from("hello")).await.unwrap();
        input_tx.send(Message::from("bye")).await.unwrap();
        let report = crate::Initiator::new(conn, SessionConfig::default())
            .run(input_rx, ShutdownSignal::never())
            .await
            .unwrap();
        assert_eq!(report.reason, crate::CloseReason::Terminator("bye".to_string()));
        assert_eq!(report.stats.messages_out, 2);
        assert_eq!(report.stats.messages_in, 2);

        let mut received = Vec::new();
        loop {
            let event = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
            match event {
                SessionEvent::MessageReceived { text, .. } => received.push(text),
                SessionEvent::Disconnected { .. } => break,
                _ => {}
            }
        }
        assert_eq!(received, vec!["hello", "bye"]);

        trigger.trigger();
        let stats = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(stats.sessions_completed, 1);
        assert_eq!(stats.sessions_failed, 0);
    }

    #[tokio::test]
    async fn test_second_client_waits_in_backlog() {
        let server = Server::bind(&loopback_config()).unwrap();
        let addr = server.local_addr();
        let (trigger, signal) = ShutdownSignal::new();
        let handle = tokio::spawn(server.run(signal));

        let mut first = client(addr).await;
        greet(&mut first).await;

        // Connect succeeds via the backlog, but no greeting until `first` ends.
        let mut second = client(addr).await;
        let early = timeout(Duration::from_millis(200), second.recv_all(GREETING.len())).await;
        assert!(early.is_err());

        first.send_all(b"exit").await.unwrap();
        greet(&mut second).await;
        second.send_all(b"bye").await.unwrap();
        assert!(second.recv_message(64).await.unwrap_err().is_peer_closed());

        trigger.trigger();
        let stats = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(stats.sessions_completed, 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_server() {
        let server = Server::bind(&loopback_config()).unwrap();
        let (trigger, signal) = ShutdownSignal::new();
        let handle = tokio::spawn(server.run(signal));

        trigger.trigger();
        let stats = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(stats, ServerStats::default());
    }

    #[tokio::test]
    async fn test_shutdown_closes_active_session() {
        let server = Server::bind(&loopback_config()).unwrap();
        let addr = server.local_addr();
        let (trigger, signal) = ShutdownSignal::new();
        let handle = tokio::spawn(server.run(signal));

        let mut active = client(addr).await;
        greet(&mut active).await;
        trigger.trigger();

        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(active.recv_message(64).await.unwrap_err().is_peer_closed());
    }

    #[tokio::test]
    async fn test_port_in_use_fails_bind() {
        let first = Server::bind(&loopback_config()).unwrap();
        let config = ServerConfig {
            listen: first.local_addr(),
            ..ServerConfig::default()
        };
        assert!(matches!(
            Server::bind(&config),
            Err(SessionError::TransportSetupFailed { .. })
        ));
    }
}
