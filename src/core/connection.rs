//! Connection management module
//!
//! Tracks active connections and their lifecycle state, and provides
//! shutdown of every live connection at once.

use dashmap::DashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Unique connection identifier
pub type ConnectionId = u64;

/// Lifecycle of one accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the first four bytes
    Detecting,
    /// Accumulating the client's obfuscation handshake
    Handshaking,
    /// Dialing the peer or the HTTP backend
    ConnectingUpstream,
    /// Bytes flowing in both directions
    Relaying,
    /// Terminal
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Detecting => "detecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::ConnectingUpstream => "connecting_upstream",
            ConnectionState::Relaying => "relaying",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Active connection handle with cancellation support
#[derive(Debug)]
struct ActiveConnection {
    peer_addr: SocketAddr,
    connected_at: Instant,
    state: ConnectionState,
    cancel_token: CancellationToken,
}

/// Point-in-time view of a connection
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub state: ConnectionState,
    pub age: std::time::Duration,
}

/// Manager for active connections
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    /// Counter for generating unique connection IDs
    next_conn_id: Arc<AtomicU64>,
    /// Map from connection_id to active connection
    connections: Arc<DashMap<ConnectionId, ActiveConnection>>,
    /// Parent of every connection token
    shutdown: CancellationToken,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    /// Create a new ConnectionManager
    pub fn new() -> Self {
        Self::with_shutdown(CancellationToken::new())
    }

    /// Connection tokens become children of `shutdown`
    pub fn with_shutdown(shutdown: CancellationToken) -> Self {
        Self {
            next_conn_id: Arc::new(AtomicU64::new(1)),
            connections: Arc::new(DashMap::new()),
            shutdown,
        }
    }

    /// Register a new connection and return its ID and cancellation token
    pub fn register(&self, peer_addr: SocketAddr) -> (ConnectionId, CancellationToken) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let cancel_token = self.shutdown.child_token();

        let conn = ActiveConnection {
            peer_addr,
            connected_at: Instant::now(),
            state: ConnectionState::Detecting,
            cancel_token: cancel_token.clone(),
        };

        self.connections.insert(conn_id, conn);
        (conn_id, cancel_token)
    }

    /// Record a state transition; ignored for unknown IDs
    pub fn set_state(&self, conn_id: ConnectionId, state: ConnectionState) {
        if let Some(mut conn) = self.connections.get_mut(&conn_id) {
            conn.state = state;
        }
    }

    pub fn state(&self, conn_id: ConnectionId) -> Option<ConnectionState> {
        self.connections.get(&conn_id).map(|conn| conn.state)
    }

    /// Unregister a connection
    pub fn unregister(&self, conn_id: ConnectionId) {
        self.connections.remove(&conn_id);
    }

    /// Cancel one connection
    pub fn close_connection(&self, conn_id: ConnectionId) -> bool {
        match self.connections.get(&conn_id) {
            Some(conn) => {
                conn.cancel_token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every live connection and refuse to hand out live tokens afterwards
    pub fn shutdown_all(&self) -> usize {
        let count = self.connections.len();
        self.shutdown.cancel();
        count
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Get the number of active connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of connections currently in `state`
    pub fn count_in_state(&self, state: ConnectionState) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().state == state)
            .count()
    }

    pub fn snapshots(&self) -> Vec<ConnectionSnapshot> {
        self.connections
            .iter()
            .map(|entry| {
                let conn = entry.value();
                ConnectionSnapshot {
                    id: *entry.key(),
                    peer_addr: conn.peer_addr,
                    state: conn.state,
                    age: conn.connected_at.elapsed(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_connection_manager_new() {
        let manager = ConnectionManager::new();
        assert_eq!(manager.connection_count(), 0);
        assert!(!manager.is_shutting_down());
    }

    #[test]
    fn test_connection_manager_register() {
        let manager = ConnectionManager::new();
        let (conn_id1, _token1) = manager.register(addr(1234));
        let (conn_id2, _token2) = manager.register(addr(1235));
        let (conn_id3, _token3) = manager.register(addr(1236));

        assert_eq!(manager.connection_count(), 3);
        assert!(conn_id1 < conn_id2);
        assert!(conn_id2 < conn_id3);
        assert_eq!(manager.state(conn_id1), Some(ConnectionState::Detecting));
    }

    #[test]
    fn test_connection_manager_unregister() {
        let manager = ConnectionManager::new();
        let (conn_id, _token) = manager.register(addr(1234));
        assert_eq!(manager.connection_count(), 1);

        manager.unregister(conn_id);
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.state(conn_id), None);

        // Unregistering twice is harmless
        manager.unregister(conn_id);
    }

    #[test]
    fn test_connection_state_transitions() {
        let manager = ConnectionManager::new();
        let (conn_id, _token) = manager.register(addr(1));
        let (_other, _token2) = manager.register(addr(2));

        manager.set_state(conn_id, ConnectionState::Handshaking);
        manager.set_state(conn_id, ConnectionState::ConnectingUpstream);
        manager.set_state(conn_id, ConnectionState::Relaying);

        assert_eq!(manager.state(conn_id), Some(ConnectionState::Relaying));
        assert_eq!(manager.count_in_state(ConnectionState::Relaying), 1);
        assert_eq!(manager.count_in_state(ConnectionState::Detecting), 1);

        let snapshots = manager.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots
            .iter()
            .any(|s| s.id == conn_id && s.peer_addr == addr(1)));

        // Unknown IDs are ignored
        manager.set_state(9999, ConnectionState::Closed);
        assert_eq!(manager.state(9999), None);
    }

    #[test]
    fn test_close_connection() {
        let manager = ConnectionManager::new();
        let (conn_id, token1) = manager.register(addr(1));
        let (_, token2) = manager.register(addr(2));

        assert!(manager.close_connection(conn_id));
        assert!(token1.is_cancelled());
        assert!(!token2.is_cancelled());
        assert!(!manager.close_connection(12345));
    }

    #[test]
    fn test_shutdown_all_cancels_every_token() {
        let shutdown = CancellationToken::new();
        let manager = ConnectionManager::with_shutdown(shutdown.clone());
        let (_, token1) = manager.register(addr(1));
        let (_, token2) = manager.register(addr(2));

        assert_eq!(manager.shutdown_all(), 2);
        assert!(token1.is_cancelled());
        assert!(token2.is_cancelled());
        assert!(shutdown.is_cancelled());

        // Late registrations start out cancelled
        let (_, late) = manager.register(addr(3));
        assert!(late.is_cancelled());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::ConnectingUpstream.to_string(), "connecting_upstream");
        assert_eq!(ConnectionState::Closed.to_string(), "closed");
    }

    #[test]
    fn test_connection_manager_concurrent() {
        use std::thread;

        let manager = ConnectionManager::new();

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let m = manager.clone();
                thread::spawn(move || {
                    for j in 0..100 {
                        let (conn_id, _) = m.register(addr((i * 1000 + j) as u16));
                        m.set_state(conn_id, ConnectionState::Relaying);
                        std::thread::yield_now();
                        m.unregister(conn_id);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        // All connections should be cleaned up
        assert_eq!(manager.connection_count(), 0);
    }
}
