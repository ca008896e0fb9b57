//! Configuration handling for the chat binary.
//!
//! Values come from built-in defaults, then an optional YAML file, then
//! environment variables. Command-line arguments are applied last by
//! `main`.

use anyhow::Result;
use chat_session::{
    ServerConfig, SessionConfig, Terminators, BACKLOG, BUFFER_SIZE, DEFAULT_HOST, DEFAULT_PORT,
    DEFAULT_TERMINATORS,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Chat configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatConfig {
    /// Port the server binds and the client dials
    pub port: u16,
    /// Host the client dials
    pub host: String,
    /// Listen backlog
    pub backlog: u32,
    /// Largest message, in bytes
    pub buffer_size: usize,
    /// Per-operation deadline
    #[serde(with = "humantime_serde_opt")]
    pub io_timeout: Option<Duration>,
    /// Session-ending texts
    pub terminators: Vec<String>,
    /// Whether the client sends the terminator before closing
    pub announce_terminator: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            host: DEFAULT_HOST.to_string(),
            backlog: BACKLOG,
            buffer_size: BUFFER_SIZE,
            io_timeout: None,
            terminators: DEFAULT_TERMINATORS.iter().map(|t| t.to_string()).collect(),
            announce_terminator: true,
        }
    }
}

/// Root of the YAML file
#[derive(Debug, Deserialize)]
struct RootConfig {
    chat: Option<FileConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    port: Option<u16>,
    host: Option<String>,
    backlog: Option<u32>,
    buffer_size: Option<usize>,
    io_timeout: Option<String>,
    terminators: Option<Vec<String>>,
    announce_terminator: Option<bool>,
}

impl ChatConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();
        let path = config_path.as_ref();

        match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    if let Some(file) = root.chat {
                        config.apply_file_config(file);
                    }
                    info!("Loaded configuration from {:?}", path);
                }
                Err(e) => warn!("Failed to parse config file {:?} ({}), using defaults", path, e),
            },
            Err(_) => info!("Config file {:?} not found, using defaults", path),
        }

        config.apply_environment_overrides();

        info!(
            "Final chat configuration: host={}, port={}, buffer_size={}, io_timeout={:?}",
            config.host, config.port, config.buffer_size, config.io_timeout
        );
        Ok(config)
    }

    fn apply_file_config(&mut self, file: FileConfig) {
        if let Some(port) = file.port {
            self.port = port;
        }
        if let Some(host) = file.host {
            self.host = host;
        }
        if let Some(backlog) = file.backlog {
            self.backlog = backlog;
        }
        if let Some(size) = file.buffer_size {
            self.set_buffer_size(size);
        }
        if let Some(timeout) = file.io_timeout {
            self.set_io_timeout(&timeout);
        }
        if let Some(terminators) = file.terminators {
            self.terminators = terminators;
        }
        if let Some(announce) = file.announce_terminator {
            self.announce_terminator = announce;
        }
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("CHAT_PORT") {
            match port.parse::<u16>() {
                Ok(p) => {
                    self.port = p;
                    info!("Port overridden by environment: {}", p);
                }
                Err(_) => warn!("Ignoring invalid CHAT_PORT {:?}", port),
            }
        }

        if let Some(host) = lookup("CHAT_HOST") {
            self.host = host;
            info!("Host overridden by environment: {}", self.host);
        }

        if let Some(size) = lookup("CHAT_BUFFER_SIZE") {
            match size.parse::<usize>() {
                Ok(s) => self.set_buffer_size(s),
                Err(_) => warn!("Ignoring invalid CHAT_BUFFER_SIZE {:?}", size),
            }
        }

        if let Some(timeout) = lookup("CHAT_IO_TIMEOUT") {
            self.set_io_timeout(&timeout);
        }
    }

    fn set_buffer_size(&mut self, size: usize) {
        if size == 0 {
            warn!("Buffer size must be positive, keeping {}", self.buffer_size);
        } else {
            self.buffer_size = size;
        }
    }

    /// `"off"` or `"0s"` disables the deadline.
    fn set_io_timeout(&mut self, value: &str) {
        if value.eq_ignore_ascii_case("off") {
            self.io_timeout = None;
            return;
        }
        match humantime::parse_duration(value) {
            Ok(d) if d.is_zero() => self.io_timeout = None,
            Ok(d) => self.io_timeout = Some(d),
            Err(e) => warn!("Ignoring invalid io_timeout {:?}: {}", value, e),
        }
    }

    /// Session settings derived from this configuration
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            buffer_size: self.buffer_size,
            terminators: Terminators::new(self.terminators.iter().cloned()),
            io_timeout: self.io_timeout,
            announce_terminator: self.announce_terminator,
            ..SessionConfig::default()
        }
    }

    /// Listener settings: all interfaces on the configured port
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port),
            backlog: self.backlog,
            session: self.session_config(),
        }
    }

    /// `host:port` for the client to dial
    pub fn connect_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Serde adapter writing `Option<Duration>` as a humantime string.
mod humantime_serde_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&humantime::format_duration(*d).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
