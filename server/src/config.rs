//! Layered server configuration.
//!
//! Precedence: built-in defaults < TOML file < env vars (COURIER_*) < CLI
//! flags. Key names on the TOML surface are camelCase to stay compatible
//! with existing deployment configs.

use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid size value {0:?}, expected a number with an optional K/M/G suffix")]
    InvalidSize(String),
    #[error("invalid bind address {0:?}: {1}")]
    InvalidAddress(String, String),
    #[error(transparent)]
    Figment(#[from] Box<figment::Error>),
}

/// COURIER websocket chat router
#[derive(Parser, Debug)]
#[command(name = "courier-server", version, about = "COURIER websocket chat router")]
pub struct Cli {
    /// Path to TOML config file
    #[arg(long, default_value = "./courier.toml")]
    pub config: String,

    /// Port to listen on (overrides config file)
    #[arg(long, env = "COURIER_PORT")]
    pub port: Option<u16>,

    /// Bind address (overrides config file)
    #[arg(long, env = "COURIER_ADDRESS")]
    pub address: Option<String>,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "COURIER_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub server: ServerConfig,
    pub rest_api: RestApiConfig,
    pub chat: ChatConfig,
    pub event: EventConfig,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Bind address; "*" means all interfaces.
    pub address: String,
    pub port: u16,
    /// WebSocket upgrade path.
    pub endpoint: String,
    /// Worker threads for the runtime; 0 picks the host CPU count.
    pub workers: usize,
    pub tmp_dir: String,
    /// Close prior connections of a user when it connects again.
    pub allow_override_connection: bool,
    pub watchdog: WatchdogConfig,
    pub secure: SecureConfig,
    pub auth: AuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "*".to_string(),
            port: 8085,
            endpoint: "/chat".to_string(),
            workers: 0,
            tmp_dir: "/tmp".to_string(),
            allow_override_connection: false,
            watchdog: WatchdogConfig::default(),
            secure: SecureConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default, rename_all = "camelCase")]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub connection_lifetime_seconds: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            connection_lifetime_seconds: 600,
        }
    }
}

/// TLS materials. Termination itself is delegated to the fronting proxy;
/// the paths are recognized so one config file serves both layers.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct SecureConfig {
    pub enabled: bool,
    pub crt_path: String,
    pub key_path: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthConfig {
    /// One of: noauth, bearer, basic, cookie, remote.
    #[serde(rename = "type")]
    pub auth_type: String,
    pub token: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub cookie_name: Option<String>,
    pub cookie_value: Option<String>,
    pub url: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            auth_type: "noauth".to_string(),
            token: None,
            user: None,
            password: None,
            cookie_name: None,
            cookie_value: None,
            url: None,
        }
    }
}

/// External management surface; recognized but served elsewhere.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default, rename_all = "camelCase")]
pub struct RestApiConfig {
    pub enabled: bool,
    pub address: String,
    pub port: u16,
    pub auth: AuthConfig,
}

impl Default for RestApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "*".to_string(),
            port: 8082,
            auth: AuthConfig::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default, rename_all = "camelCase")]
pub struct ChatConfig {
    pub message: MessageConfig,
    pub enable_undelivered_queue: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            message: MessageConfig::default(),
            enable_undelivered_queue: true,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default, rename_all = "camelCase")]
pub struct MessageConfig {
    /// Human-readable size cap, e.g. "10M".
    pub max_size: String,
    pub enable_delivery_status: bool,
    pub enable_send_back: bool,
    /// Payload types excluded from send-back, compared case-insensitively.
    pub ignore_types_send_back: Vec<String>,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            max_size: "10M".to_string(),
            enable_delivery_status: false,
            enable_send_back: false,
            ignore_types_send_back: Vec::new(),
        }
    }
}

/// Webhook event notifier; consumes the message-listener hook, configured
/// here but implemented by the sidecar.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default, rename_all = "camelCase")]
pub struct EventConfig {
    pub enabled: bool,
    pub enable_retry: bool,
    pub retry_interval_seconds: u64,
    pub retry_count: u32,
    pub send_strategy: String,
    pub targets: Vec<serde_json::Value>,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            enable_retry: false,
            retry_interval_seconds: 10,
            retry_count: 3,
            send_strategy: "onlineOnly".to_string(),
            targets: Vec::new(),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (COURIER_*) < CLI args
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&cli.config))
            .merge(Env::prefixed("COURIER_").split("__"))
            .extract()
            .map_err(Box::new)?;

        if let Some(port) = cli.port {
            config.server.port = port;
        }
        if let Some(address) = &cli.address {
            config.server.address = address.clone();
        }

        Ok(config)
    }

    /// Maximum inbound message size in bytes, parsed from `chat.message.maxSize`.
    pub fn max_message_size(&self) -> Result<usize, ConfigError> {
        parse_size(&self.chat.message.max_size)
    }

    /// Worker thread count, substituting the host CPU count for 0.
    pub fn worker_threads(&self) -> usize {
        if self.server.workers > 0 {
            self.server.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
        }
    }

    /// Socket address to bind, validating `server.address` by parsing.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        resolve_bind_addr(&self.server.address, self.server.port)
    }

    /// Upgrade path with a guaranteed leading slash.
    pub fn endpoint_path(&self) -> String {
        let endpoint = self.server.endpoint.trim();
        if endpoint.starts_with('/') {
            endpoint.to_string()
        } else {
            format!("/{}", endpoint)
        }
    }
}

/// Parse a human-readable byte size: plain number or K/M/G suffix.
pub fn parse_size(input: &str) -> Result<usize, ConfigError> {
    let s = input.trim();
    let err = || ConfigError::InvalidSize(input.to_string());

    if s.is_empty() {
        return Err(err());
    }

    let (digits, multiplier) = match s.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => {
            let mult: usize = match c.to_ascii_uppercase() {
                'B' => 1,
                'K' => 1024,
                'M' => 1024 * 1024,
                'G' => 1024 * 1024 * 1024,
                _ => return Err(err()),
            };
            (s[..s.len() - 1].trim_end(), mult)
        }
        _ => (s, 1),
    };

    let n: usize = digits.parse().map_err(|_| err())?;
    n.checked_mul(multiplier).ok_or_else(err)
}

/// Render a byte count the way `maxSize` is written, for close reasons.
pub fn human_bytes(n: usize) -> String {
    const K: usize = 1024;
    const M: usize = 1024 * 1024;
    const G: usize = 1024 * 1024 * 1024;
    if n >= G && n % G == 0 {
        format!("{}G", n / G)
    } else if n >= M && n % M == 0 {
        format!("{}M", n / M)
    } else if n >= K && n % K == 0 {
        format!("{}K", n / K)
    } else {
        format!("{}B", n)
    }
}

/// Validate the bind address by parsing instead of by length.
pub fn resolve_bind_addr(address: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    let ip: IpAddr = match address.trim() {
        "" | "*" => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        other => other.parse().map_err(|e: std::net::AddrParseError| {
            ConfigError::InvalidAddress(address.to_string(), e.to_string())
        })?,
    };
    Ok(SocketAddr::new(ip, port))
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# COURIER chat router configuration
# Place this file at ./courier.toml or specify with --config <path>
# Nested settings can be overridden via environment variables with a
# double-underscore separator (COURIER_SERVER__PORT, etc.) or CLI flags.

[server]
# Bind address; "*" binds all interfaces
# address = "*"
# port = 8085
# WebSocket upgrade path
# endpoint = "/chat"
# Worker threads; 0 = host CPU count
# workers = 0
# tmpDir = "/tmp"
# Replace existing connections when the same user connects again
# allowOverrideConnection = false

[server.watchdog]
# enabled = false
# Evict connections idle longer than this many seconds
# connectionLifetimeSeconds = 600

[server.secure]
# TLS materials, consumed by the fronting terminator
# enabled = false
# crtPath = ""
# keyPath = ""

[server.auth]
# One of: noauth, bearer, basic, cookie, remote
# type = "noauth"
# token = ""              # bearer
# user = ""               # basic
# password = ""           # basic
# cookieName = ""         # cookie
# cookieValue = ""        # cookie
# url = ""                # remote

[restApi]
# enabled = false
# address = "*"
# port = 8082

[chat]
# Retain messages for offline recipients and redeliver on reconnect
# enableUndeliveredQueue = true

[chat.message]
# Maximum inbound message size; K/M/G suffixes accepted
# maxSize = "10M"
# Emit a message_sent acknowledgment after successful delivery
# enableDeliveryStatus = false
# Echo accepted payloads back to their sender
# enableSendBack = false
# Payload types excluded from send-back (case-insensitive)
# ignoreTypesSendBack = ["typing"]

[event]
# Webhook notifier sidecar
# enabled = false
# enableRetry = false
# retryIntervalSeconds = 10
# retryCount = 3
# sendStrategy = "onlineOnly"
# targets = []
"#
    .to_string()
}
