//! Core proxy server implementation
//!
//! The Server struct holds everything a connection task needs.

use bytes::Bytes;
use std::sync::Arc;

use super::connection::ConnectionManager;
use super::hooks::{NoopStatistics, StatisticsSink};
use super::peer::PeerSelector;
use super::upstream::UpstreamConnector;
use crate::config::{ConnConfig, ProxyConfig};
use crate::error::Result;

/// Core proxy server
pub struct Server {
    /// Secret clients derive their handshake keys with
    pub secret: Bytes,
    /// Peer selection and dialing
    pub upstream: UpstreamConnector,
    /// HTTP fallback; HTTP connections are dropped without one
    pub http_backend: Option<String>,
    /// Statistics collector
    pub stats: Arc<dyn StatisticsSink>,
    /// Connection manager
    pub conn_manager: ConnectionManager,
    /// Connection performance configuration
    pub conn_config: ConnConfig,
}

impl Server {
    /// Create a new server builder
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Build a server from validated configuration
    pub fn from_config(
        config: &ProxyConfig,
        stats: Arc<dyn StatisticsSink>,
        conn_manager: ConnectionManager,
    ) -> Result<Self> {
        Ok(Server::builder()
            .secret(config.secret.clone())
            .peers(PeerSelector::new(config.peers.clone())?)
            .http_backend(config.http_backend.clone())
            .stats(stats)
            .conn_manager(conn_manager)
            .conn_config(config.conn)
            .build())
    }
}

/// Builder for constructing a Server
pub struct ServerBuilder {
    secret: Option<Bytes>,
    peers: Option<PeerSelector>,
    http_backend: Option<String>,
    stats: Option<Arc<dyn StatisticsSink>>,
    conn_manager: Option<ConnectionManager>,
    conn_config: Option<ConnConfig>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    /// Create a new server builder with default settings
    pub fn new() -> Self {
        Self {
            secret: None,
            peers: None,
            http_backend: None,
            stats: None,
            conn_manager: None,
            conn_config: None,
        }
    }

    /// Set the global secret
    pub fn secret(mut self, secret: Bytes) -> Self {
        self.secret = Some(secret);
        self
    }

    /// Set upstream peers
    pub fn peers(mut self, peers: PeerSelector) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Set or clear the HTTP fallback backend
    pub fn http_backend(mut self, backend: Option<String>) -> Self {
        self.http_backend = backend;
        self
    }

    /// Set statistics collector
    pub fn stats(mut self, stats: Arc<dyn StatisticsSink>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Set connection manager
    pub fn conn_manager(mut self, manager: ConnectionManager) -> Self {
        self.conn_manager = Some(manager);
        self
    }

    /// Set connection configuration
    pub fn conn_config(mut self, config: ConnConfig) -> Self {
        self.conn_config = Some(config);
        self
    }

    /// Build the server
    ///
    /// Panics if secret, peers or conn_config is not set
    pub fn build(self) -> Server {
        let conn_config = self.conn_config.expect("conn_config is required");
        Server {
            secret: self.secret.expect("secret is required"),
            upstream: UpstreamConnector::new(self.peers.expect("peers are required"), conn_config),
            http_backend: self.http_backend,
            stats: self.stats.unwrap_or_else(|| Arc::new(NoopStatistics)),
            conn_manager: self.conn_manager.unwrap_or_default(),
            conn_config,
        }
    }
}
