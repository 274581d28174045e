//! # Configuration Management
//!
//! Centralized configuration for the messaging layer.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (`INTERLINK_*`)
//!
//! ## Example
//! ```toml
//! [identity]
//! server_name = "lobby-1"
//! shared_secret = "change-me-to-a-long-random-value"
//!
//! [pubsub]
//! host = "127.0.0.1"
//! port = 6379
//! channel = "interlink"
//!
//! [socket]
//! port = 25590
//!
//! [socket.peers.survival-1]
//! host = "10.0.0.12"
//! port = 25590
//! ```

use crate::core::serialization::SerializationFormat;
use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Current supported protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Magic bytes opening every frame ("ILNK")
pub const MAGIC_BYTES: [u8; 4] = [0x49, 0x4C, 0x4E, 0x4B];

/// Max allowed frame body size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default channel name on the pub/sub bus
pub const DEFAULT_CHANNEL: &str = "interlink";

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct MessagingConfig {
    #[serde(default)]
    pub identity: IdentityConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub pubsub: PubSubConfig,

    #[serde(default)]
    pub socket: SocketConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl MessagingConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("INTERLINK_SERVER_NAME") {
            config.identity.server_name = name;
        }

        if let Ok(secret) = std::env::var("INTERLINK_SHARED_SECRET") {
            config.identity.shared_secret = Some(secret);
        }

        if let Ok(host) = std::env::var("INTERLINK_PUBSUB_HOST") {
            config.pubsub.host = host;
        }

        if let Ok(port) = std::env::var("INTERLINK_PUBSUB_PORT") {
            config.pubsub.port = port.parse::<u16>().map_err(|_| {
                ProtocolError::ConfigError(format!("Invalid INTERLINK_PUBSUB_PORT: {port}"))
            })?;
        }

        if let Ok(channel) = std::env::var("INTERLINK_PUBSUB_CHANNEL") {
            config.pubsub.channel = channel;
        }

        if let Ok(port) = std::env::var("INTERLINK_SOCKET_PORT") {
            config.socket.port = port.parse::<u16>().map_err(|_| {
                ProtocolError::ConfigError(format!("Invalid INTERLINK_SOCKET_PORT: {port}"))
            })?;
        }

        if let Ok(timeout) = std::env::var("INTERLINK_RESPONSE_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.socket.response_timeout = Duration::from_millis(val);
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.identity.validate());
        errors.extend(self.dispatch.validate());
        errors.extend(self.pubsub.validate());
        errors.extend(self.socket.validate(&self.identity.server_name));
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Who this process is on the network
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Server name used as envelope sender and as peer name on sockets
    pub server_name: String,

    /// Shared secret for envelope signatures; signing is off when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_secret: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            server_name: String::from("server-1"),
            shared_secret: None,
        }
    }
}

impl IdentityConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.server_name.is_empty() {
            errors.push("Server name cannot be empty".to_string());
        } else if self.server_name == crate::protocol::packet::BROADCAST {
            errors.push("Server name cannot be the broadcast channel '*'".to_string());
        } else if self.server_name.len() > 64 {
            errors.push(format!(
                "Server name too long: {} characters (maximum: 64)",
                self.server_name.len()
            ));
        }

        if let Some(secret) = &self.shared_secret {
            if secret.len() < 16 {
                errors.push("Shared secret too short (minimum: 16 bytes)".to_string());
            }
        }

        errors
    }
}

/// Receive-side processing shared by both transports
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Body format for outgoing frames (incoming frames declare their own). Transports use
    /// the format of their dispatcher's registry; [`Dispatcher::from_config`] applies this one.
    ///
    /// [`Dispatcher::from_config`]: crate::protocol::dispatcher::Dispatcher::from_config
    pub format: SerializationFormat,

    /// How long received envelope ids are remembered for duplicate suppression
    #[serde(with = "duration_serde")]
    pub dedup_window: Duration,

    /// Maximum number of remembered envelope ids
    pub dedup_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            format: SerializationFormat::Json,
            dedup_window: Duration::from_secs(300),
            dedup_capacity: 10_000,
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.dedup_window.as_millis() < 100 {
            errors.push("Dedup window too short (minimum: 100ms)".to_string());
        }

        if self.dedup_capacity == 0 {
            errors.push("Dedup capacity must be greater than 0".to_string());
        }

        errors
    }
}

/// Pub/sub bus configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Bus host
    pub host: String,

    /// Bus port
    pub port: u16,

    /// Optional bus password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Channel every participating server subscribes and publishes to
    pub channel: String,

    /// Whether envelopes this server published are dropped instead of dispatched
    pub filter_self: bool,

    /// First delay before resubscribing after a failure
    #[serde(with = "duration_serde")]
    pub retry_initial_delay: Duration,

    /// Ceiling for resubscribe backoff
    #[serde(with = "duration_serde")]
    pub retry_max_delay: Duration,

    /// Interval between presence heartbeats
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    /// How long a peer stays listed after its last message
    #[serde(with = "duration_serde")]
    pub peer_expiry: Duration,

    /// Maximum number of envelopes waiting to be published
    pub publish_queue: usize,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            host: String::from("127.0.0.1"),
            port: 6379,
            password: None,
            channel: String::from(DEFAULT_CHANNEL),
            filter_self: false,
            retry_initial_delay: timeout::RETRY_INITIAL_DELAY,
            retry_max_delay: timeout::RETRY_MAX_DELAY,
            heartbeat_interval: timeout::HEARTBEAT_INTERVAL,
            peer_expiry: Duration::from_secs(15),
            publish_queue: 1024,
        }
    }
}

impl PubSubConfig {
    /// Connection URL for the bus
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{}@{}:{}/", password, self.host, self.port),
            None => format!("redis://{}:{}/", self.host, self.port),
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.host.is_empty() {
            errors.push("Pub/sub host cannot be empty".to_string());
        }

        if self.port == 0 {
            errors.push("Pub/sub port must be greater than 0".to_string());
        }

        if self.channel.is_empty() {
            errors.push("Pub/sub channel cannot be empty".to_string());
        }

        if self.retry_initial_delay.as_millis() < 10 {
            errors.push("Retry initial delay too short (minimum: 10ms)".to_string());
        }

        if self.retry_max_delay < self.retry_initial_delay {
            errors.push("Retry max delay cannot be shorter than the initial delay".to_string());
        }

        if self.heartbeat_interval.as_millis() < 100 {
            errors.push("Heartbeat interval too short (minimum: 100ms)".to_string());
        }

        if self.peer_expiry <= self.heartbeat_interval {
            errors.push("Peer expiry must be longer than the heartbeat interval".to_string());
        }

        if self.publish_queue == 0 {
            errors.push("Publish queue must be greater than 0".to_string());
        }

        errors
    }
}

/// How a dropped socket connection is re-established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectMode {
    /// Redial automatically with exponential backoff
    Backoff,
    /// Stay disconnected until `reconnect(peer)` is called
    Manual,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub mode: ReconnectMode,

    /// Consecutive failed dials before giving up (0 = never give up)
    pub max_attempts: u32,

    #[serde(with = "duration_serde")]
    pub initial_delay: Duration,

    #[serde(with = "duration_serde")]
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            mode: ReconnectMode::Backoff,
            max_attempts: 0,
            initial_delay: timeout::RETRY_INITIAL_DELAY,
            max_delay: timeout::RETRY_MAX_DELAY,
        }
    }
}

/// Address of a statically configured peer
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PeerConfig {
    pub host: String,
    pub port: u16,
}

impl PeerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Direct socket transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Interface to listen on
    pub bind_host: String,

    /// Listen port (0 picks a free port)
    pub port: u16,

    /// Timeout for a dial plus hello exchange
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Default time a `send` waits for its response
    #[serde(with = "duration_serde")]
    pub response_timeout: Duration,

    /// Maximum frame body size accepted or sent
    pub max_frame_size: usize,

    /// Outgoing frames buffered per connection before sends fail with backpressure
    pub send_queue: usize,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Static peer table: server name -> address
    #[serde(default)]
    pub peers: BTreeMap<String, PeerConfig>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            bind_host: String::from("0.0.0.0"),
            port: 25590,
            connect_timeout: timeout::CONNECT_TIMEOUT,
            response_timeout: timeout::RESPONSE_TIMEOUT,
            max_frame_size: MAX_FRAME_SIZE,
            send_queue: 256,
            reconnect: ReconnectConfig::default(),
            peers: BTreeMap::new(),
        }
    }
}

impl SocketConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }

    pub fn validate(&self, server_name: &str) -> Vec<String> {
        let mut errors = Vec::new();

        if self.bind_address().parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid bind address: '{}' (expected an IP such as '0.0.0.0')",
                self.bind_host
            ));
        }

        if self.connect_timeout.as_millis() < 100 {
            errors.push("Connect timeout too short (minimum: 100ms)".to_string());
        } else if self.connect_timeout.as_secs() > 300 {
            errors.push("Connect timeout too long (maximum: 300s)".to_string());
        }

        if self.response_timeout.as_millis() < 10 {
            errors.push("Response timeout too short (minimum: 10ms)".to_string());
        }

        if self.max_frame_size < 1024 {
            errors.push("Max frame size too small (minimum: 1 KB)".to_string());
        } else if self.max_frame_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max frame size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_frame_size
            ));
        }

        if self.send_queue == 0 {
            errors.push("Send queue must be greater than 0".to_string());
        }

        if self.reconnect.initial_delay.as_millis() < 10 {
            errors.push("Reconnect delay too short (minimum: 10ms)".to_string());
        }

        if self.reconnect.max_delay < self.reconnect.initial_delay {
            errors.push("Reconnect max delay cannot be shorter than the initial delay".to_string());
        }

        for (name, peer) in &self.peers {
            if name.is_empty() || name == crate::protocol::packet::BROADCAST {
                errors.push(format!("Invalid peer name: '{name}'"));
            }
            if name == server_name {
                errors.push(format!("Peer table contains this server's own name: '{name}'"));
            }
            if peer.host.is_empty() || peer.port == 0 {
                errors.push(format!("Invalid address for peer '{name}': '{}'", peer.address()));
            }
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    pub log_to_console: bool,

    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("interlink"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization (milliseconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
