use std::io;
use thiserror::Error;

use crate::core::HandshakeError;

/// Unified error type for the relay
#[derive(Error, Debug)]
pub enum ProxyError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Obfuscation handshake error
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Upstream peer or backend could not be reached
    #[error("Connection to {addr} failed: {source}")]
    PeerConnect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// A bounded wait expired
    #[error("Timeout: {0}")]
    Timeout(&'static str),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ProxyError>;

impl From<anyhow::Error> for ProxyError {
    fn from(err: anyhow::Error) -> Self {
        ProxyError::Other(err.to_string())
    }
}

impl From<toml::de::Error> for ProxyError {
    fn from(err: toml::de::Error) -> Self {
        ProxyError::Config(format!("TOML parse error: {}", err))
    }
}
