//! Chat binary.
//!
//! `chat serve [PORT]` runs the responder, serving one client at a time.
//! `chat connect [HOST] [PORT]` runs the initiator, reading messages from
//! stdin until a terminator is entered.

use anyhow::Context;
use chat_session::{
    connect_tcp, CloseReason, Initiator, Message, Server, SessionError, SessionEvent,
    ShutdownSignal, ShutdownTrigger,
};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::ChatConfig;
use logging::ChatLogFormatter;

const PROMPT: &str = "Enter your message: ";

/// Point-to-point line messaging over TCP
#[derive(Parser, Debug)]
#[command(name = "chat", version, about = "Point-to-point line messaging over TCP")]
struct Args {
    /// Configuration file path
    #[arg(long, global = true, default_value = "chat.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Deadline for each send/receive, e.g. 30s
    #[arg(long, global = true)]
    io_timeout: Option<humantime::Duration>,

    /// Largest message in bytes
    #[arg(long, global = true)]
    buffer_size: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept clients and acknowledge their messages
    Serve {
        /// Port to listen on
        port: Option<String>,
    },
    /// Connect to a server and send lines from stdin
    Connect {
        /// Server host
        host: Option<String>,
        /// Server port
        port: Option<String>,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("chat={}", args.log_level).parse()?)
        .add_directive(format!("chat_session={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .event_format(ChatLogFormatter::new("chat"))
        .init();

    info!("Starting chat v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ChatConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;
    if let Some(timeout) = args.io_timeout {
        config.io_timeout = Some(timeout.into());
    }
    if let Some(size) = args.buffer_size.filter(|s| *s > 0) {
        config.buffer_size = size;
    }

    let (trigger, shutdown) = ShutdownSignal::new();
    install_signal_handlers(trigger)?;

    match args.command {
        Command::Serve { port } => {
            config.port = parse_port(port.as_deref(), config.port);
            debug!("Effective configuration:\n{}", serde_yaml::to_string(&config)?);
            serve(&config, shutdown).await
        }
        Command::Connect { host, port } => {
            if let Some(host) = host {
                config.host = host;
            }
            config.port = parse_port(port.as_deref(), config.port);
            debug!("Effective configuration:\n{}", serde_yaml::to_string(&config)?);
            connect(&config, shutdown).await
        }
    }
}

/// Port from the command line, falling back to `default` when absent or invalid
fn parse_port(arg: Option<&str>, default: u16) -> u16 {
    match arg {
        None => {
            info!("No port specified, using default {}", default);
            default
        }
        Some(raw) => match raw.trim().parse::<u16>() {
            Ok(port) if port != 0 => port,
            _ => {
                warn!("Invalid port {:?}, using default {}", raw, default);
                default
            }
        },
    }
}

async fn serve(config: &ChatConfig, shutdown: ShutdownSignal) -> anyhow::Result<()> {
    let server_config = config.server_config();
    let server = Server::bind(&server_config)
        .with_context(|| format!("Failed to start server on port {}", config.port))?;
    component_info!("server", "Server is listening on port {}...", server.local_addr().port());

    let (event_tx, mut event_rx) = mpsc::channel(64);
    let display = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if let SessionEvent::MessageReceived { text, .. } = event {
                println!("Client > {}", text);
            }
        }
    });

    let stats = server.with_events(event_tx).run(shutdown).await;
    display.await.ok();
    component_info!(
        "server",
        sessions = stats.sessions_completed,
        failed = stats.sessions_failed,
        "Server stopped"
    );
    Ok(())
}

async fn connect(config: &ChatConfig, shutdown: ShutdownSignal) -> anyhow::Result<()> {
    let addr = config.connect_addr();
    let conn = connect_tcp(&addr)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;
    component_info!("client", "Connected to the server at {}", addr);

    let (event_tx, mut event_rx) = mpsc::channel(16);
    let display = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                SessionEvent::GreetingReceived { text } | SessionEvent::Acknowledged { text } => {
                    println!("Server > {}", text);
                    print!("{}", PROMPT);
                    std::io::stdout().flush().ok();
                }
                SessionEvent::Disconnected { .. } => println!(),
                _ => {}
            }
        }
    });

    let input = spawn_stdin_reader();
    let session = Initiator::new(conn, config.session_config()).with_events(event_tx);
    let outcome = session.run(input, shutdown).await;
    display.await.ok();

    match outcome {
        Ok(report) => {
            match &report.reason {
                CloseReason::Terminator(text) => {
                    component_info!("client", "Closing connection after {:?}", text)
                }
                CloseReason::PeerClosed => component_warn!("client", "Server closed the connection"),
                CloseReason::InputExhausted => component_info!("client", "Input closed"),
            }
            component_info!(
                "client",
                messages_out = report.stats.messages_out,
                bytes_out = report.stats.bytes_out,
                "Disconnected"
            );
            Ok(())
        }
        Err(SessionError::Cancelled) => {
            component_info!("client", "Session cancelled by shutdown");
            Ok(())
        }
        Err(e) => {
            component_error!("client", "Session with {} failed: {}", addr, e);
            Err(e).context("Chat session failed")
        }
    }
}

/// Feed stdin lines to the session.
///
/// Runs on a plain thread: a blocked stdin read must not hold up runtime
/// shutdown once the session has ended.
fn spawn_stdin_reader() -> mpsc::Receiver<Message> {
    let (tx, rx) = mpsc::channel(1);
    std::thread::spawn(move || forward_lines(std::io::stdin().lock(), &tx));
    rx
}

/// Send each line of `reader` as raw bytes, without its line ending.
///
/// Lines need not be UTF-8. Stops at end of input, on a read error, or once
/// the session stops listening.
fn forward_lines<R: BufRead>(mut reader: R, tx: &mpsc::Sender<Message>) {
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Failed to read input: {}", e);
                break;
            }
        }
        if line.ends_with(b"\n") {
            line.pop();
            if line.ends_with(b"\r") {
                line.pop();
            }
        }
        if tx.blocking_send(Message::from(std::mem::take(&mut line))).is_err() {
            break;
        }
    }
}

/// Turn SIGINT/SIGTERM into a shutdown request
fn install_signal_handlers(trigger: ShutdownTrigger) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                _ = sigint.recv() => info!("Received SIGINT, shutting down"),
            }
            trigger.trigger();
        });
    }

    #[cfg(not(unix))]
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
            trigger.trigger();
        }
    });

    Ok(())
}
