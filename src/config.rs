//! Configuration module
//!
//! CLI arguments (with environment variable fallbacks) locate a TOML file that
//! holds the proxy settings. Everything is validated once at startup; any
//! error is fatal.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use clap::Parser;
use md5::{Digest, Md5};
use serde::{Deserialize, Deserializer};

use crate::core::PeerRecord;
use crate::error::ProxyError;
use crate::logger::{log, LogLevel};

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '60s', '2m', '1h' or plain seconds",
            s
        )
    })
}

/// Length of the global secret in bytes
pub const SECRET_LEN: usize = 16;

/// Default config file path
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

/// CLI arguments for the relay
///
/// Supports environment variables with MTPROXY_ prefix
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Obfuscated MTProto relay with HTTP fallback")]
pub struct CliArgs {
    /// Path to the TOML configuration file
    #[arg(
        short = 'c',
        long = "config-file",
        env = "MTPROXY_CONFIG_FILE",
        default_value = DEFAULT_CONFIG_FILE
    )]
    pub config_file: PathBuf,

    /// Log level: trace, debug, info, warn, error (overrides the config file)
    #[arg(long = "log-level", env = "MTPROXY_LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the CLI arguments
    pub fn validate(&self) -> Result<()> {
        if !self.config_file.exists() {
            return Err(anyhow!(
                "Config file not found: {}",
                self.config_file.display()
            ));
        }
        if let Some(ref level) = self.log_level {
            level.parse::<LogLevel>().map_err(|e| anyhow!(e))?;
        }
        Ok(())
    }

    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level.as_deref().and_then(|s| s.parse().ok())
    }
}

// ==================== File format ====================

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Text(String),
    Seconds(u64),
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match RawDuration::deserialize(deserializer)? {
        RawDuration::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
        RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
    }
}

fn default_acceptor_threads() -> usize {
    1
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_report_interval() -> Duration {
    Duration::from_secs(300)
}

/// Raw contents of the configuration file
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub listen_addresses: Vec<String>,
    pub secret: Option<String>,
    pub secret_passphrase: Option<String>,
    #[serde(default)]
    pub peers: Vec<String>,
    pub http_backend: Option<String>,
    #[serde(default = "default_acceptor_threads")]
    pub acceptor_threads: usize,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(
        default = "default_report_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub statistics_report_interval: Duration,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub log: LogSection,
}

impl FileConfig {
    pub fn from_toml_str(content: &str) -> crate::error::Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

/// `[connection]` table
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionSection {
    #[serde(deserialize_with = "deserialize_duration")]
    pub handshake_timeout: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub connect_timeout: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub idle_timeout: Duration,
    pub buffer_size: usize,
    pub tcp_backlog: i32,
    pub tcp_nodelay: bool,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        let conn = ConnConfig::default();
        Self {
            handshake_timeout: conn.handshake_timeout,
            connect_timeout: conn.connect_timeout,
            idle_timeout: conn.idle_timeout,
            buffer_size: conn.buffer_size,
            tcp_backlog: conn.tcp_backlog,
            tcp_nodelay: conn.tcp_nodelay,
        }
    }
}

/// `[log]` table
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogSection {
    pub level: Option<String>,
}

// ==================== Runtime configuration ====================

/// Connection performance configuration
#[derive(Debug, Clone, Copy)]
pub struct ConnConfig {
    /// Protocol detection plus the client's obfuscation handshake
    pub handshake_timeout: Duration,
    /// TCP connect to a peer or the HTTP backend, including the upstream handshake
    pub connect_timeout: Duration,
    /// Relay idle timeout
    pub idle_timeout: Duration,
    /// Buffer size for data transfer
    pub buffer_size: usize,
    /// TCP listen backlog
    pub tcp_backlog: i32,
    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30 * 60),
            buffer_size: 16 * 1024,
            tcp_backlog: 128,
            tcp_nodelay: true,
        }
    }
}

/// Validated proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addresses: Vec<SocketAddr>,
    /// Global secret clients must derive their handshake with
    pub secret: Bytes,
    pub peers: Vec<PeerRecord>,
    /// `host:port` of the HTTP fallback; HTTP connections are dropped without it
    pub http_backend: Option<String>,
    pub acceptor_threads: usize,
    pub worker_threads: usize,
    /// Zero disables the statistics reporter
    pub statistics_report_interval: Duration,
    pub conn: ConnConfig,
    pub log_level: Option<LogLevel>,
}

impl ProxyConfig {
    /// Read, parse and validate a configuration file
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_file_config(FileConfig::from_toml_str(&content)?)
    }

    pub fn from_file_config(file: FileConfig) -> crate::error::Result<Self> {
        let secret = parse_secret(file.secret.as_deref(), file.secret_passphrase.as_deref())?;

        if file.listen_addresses.is_empty() {
            return Err(config_error("at least one listen address is required"));
        }
        let listen_addresses = file
            .listen_addresses
            .iter()
            .map(|s| parse_listen_address(s))
            .collect::<crate::error::Result<Vec<_>>>()?;

        if file.peers.is_empty() {
            return Err(config_error("at least one peer is required"));
        }
        let peers = file
            .peers
            .iter()
            .map(|s| PeerRecord::parse(s))
            .collect::<crate::error::Result<Vec<_>>>()?;

        let http_backend = match file.http_backend {
            Some(backend) => {
                validate_host_port(&backend).map_err(|e| {
                    config_error(format!("cannot parse HTTP backend address {}: {}", backend, e))
                })?;
                Some(backend)
            }
            None => None,
        };

        if file.acceptor_threads == 0 {
            return Err(config_error("acceptor_threads must be greater than 0"));
        }
        if file.worker_threads == 0 {
            return Err(config_error("worker_threads must be greater than 0"));
        }

        let section = file.connection;
        if section.buffer_size == 0 {
            return Err(config_error("connection.buffer_size must be greater than 0"));
        }
        if section.tcp_backlog <= 0 {
            return Err(config_error("connection.tcp_backlog must be greater than 0"));
        }
        if section.handshake_timeout.is_zero() {
            return Err(config_error("connection.handshake_timeout must be greater than 0"));
        }
        if section.connect_timeout.is_zero() {
            return Err(config_error("connection.connect_timeout must be greater than 0"));
        }
        if section.idle_timeout.is_zero() {
            return Err(config_error("connection.idle_timeout must be greater than 0"));
        }

        let log_level = match file.log.level {
            Some(level) => Some(level.parse::<LogLevel>().map_err(config_error)?),
            None => None,
        };

        Ok(Self {
            listen_addresses,
            secret,
            peers,
            http_backend,
            acceptor_threads: file.acceptor_threads,
            worker_threads: file.worker_threads,
            statistics_report_interval: file.statistics_report_interval,
            conn: ConnConfig {
                handshake_timeout: section.handshake_timeout,
                connect_timeout: section.connect_timeout,
                idle_timeout: section.idle_timeout,
                buffer_size: section.buffer_size,
                tcp_backlog: section.tcp_backlog,
                tcp_nodelay: section.tcp_nodelay,
            },
            log_level,
        })
    }

    /// Print the loaded values at startup
    pub fn log_summary(&self) {
        log::info!("Loaded configuration values:");
        log::info!(" .. secret key: {}", hex::encode(&self.secret));
        log::info!(" .. peers:");
        for peer in &self.peers {
            log::info!("      {}", peer);
        }
        log::info!(" .. listen addresses:");
        for addr in &self.listen_addresses {
            log::info!("      {}", addr);
        }
        log::info!(
            " .. HTTP backend address: {}",
            self.http_backend
                .as_deref()
                .unwrap_or("<none, drop connections>")
        );
        log::info!(
            " .. acceptor threads: {}, worker threads: {}",
            self.acceptor_threads,
            self.worker_threads
        );
        if self.statistics_report_interval.is_zero() {
            log::info!(" .. statistics report interval: <disabled>");
        } else {
            log::info!(
                " .. statistics report interval: {}",
                humantime::format_duration(self.statistics_report_interval)
            );
        }
    }
}

fn config_error(msg: impl Into<String>) -> ProxyError {
    ProxyError::Config(msg.into())
}

/// Resolve the global secret from exactly one of its two forms
///
/// `secret` is 16 bytes of hex; `passphrase` is hashed with MD5.
pub fn parse_secret(
    secret: Option<&str>,
    passphrase: Option<&str>,
) -> crate::error::Result<Bytes> {
    match (secret, passphrase) {
        (None, None) => Err(config_error(
            "either 'secret' or 'secret_passphrase' must be specified",
        )),
        (Some(_), Some(_)) => Err(config_error(
            "only one of 'secret' or 'secret_passphrase' may be specified",
        )),
        (Some(hex_secret), None) => {
            let bytes = hex::decode(hex_secret.trim())
                .map_err(|e| config_error(format!("cannot parse 'secret' value: {}", e)))?;
            if bytes.len() != SECRET_LEN {
                return Err(config_error(format!(
                    "secret must be exactly {} bytes long, got {}",
                    SECRET_LEN,
                    bytes.len()
                )));
            }
            Ok(Bytes::from(bytes))
        }
        (None, Some(passphrase)) => {
            let digest = Md5::digest(passphrase.as_bytes());
            Ok(Bytes::copy_from_slice(&digest))
        }
    }
}

fn parse_listen_address(s: &str) -> crate::error::Result<SocketAddr> {
    s.to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| config_error(format!("cannot parse listen address: {}", s)))
}

fn validate_host_port(s: &str) -> Result<(), &'static str> {
    let (host, port) = s.rsplit_once(':').ok_or("missing port")?;
    if host.is_empty() || host == "[]" {
        return Err("missing host");
    }
    port.parse::<u16>().map_err(|_| "invalid port")?;
    Ok(())
}
