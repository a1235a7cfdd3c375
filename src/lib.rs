//! Obfuscated MTProto relay with HTTP fallback
//!
//! Architecture:
//! - `core/`: Handshake, ciphers, peer selection and relaying
//! - `handler`: Per-connection state machine
//! - `server_runner`: Listener setup and accept loop
//! - `stats`: Connection statistics and periodic reporting
//! - `config`: CLI arguments and the TOML configuration file

pub mod config;
pub mod core;
pub mod error;
pub mod handler;
pub mod logger;
pub mod server_runner;
pub mod stats;
