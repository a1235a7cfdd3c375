//! Core proxy module
//!
//! This module contains the core proxy functionality:
//! - Protocol detection and the obfuscation handshake
//! - Stream ciphers and stream wrappers
//! - Peer selection and upstream dialing
//! - Connection management and bidirectional relay
//! - Statistics hook traits

pub mod cipher;
mod connection;
pub mod handshake;
pub mod hooks;
pub mod peer;
pub mod relay;
mod server;
pub mod sniffer;
pub mod stream;
pub mod upstream;

pub use connection::{ConnectionId, ConnectionManager, ConnectionSnapshot, ConnectionState};
pub use handshake::{CipherPair, HandshakeError};
pub use hooks::{ConnectionType, StatisticsSink};
pub use peer::{PeerRecord, PeerSelector};
pub use relay::{CloseReason, RelayHandle, RelayOutcome, RelayPair};
pub use server::{Server, ServerBuilder};
pub use sniffer::Protocol;
