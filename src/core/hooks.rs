//! Hook traits for extensibility
//!
//! The core reports connection lifecycle events through [`StatisticsSink`];
//! the binary plugs in [`crate::stats::StatisticsTracker`].

use std::fmt;

/// Kind of traffic carried by a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// Obfuscated MTProto relayed to a datacenter peer
    Mtproto,
    /// HTTP tunneled to the fallback backend
    Http,
}

impl ConnectionType {
    /// Every variant, in counter order
    pub const ALL: [ConnectionType; 2] = [ConnectionType::Mtproto, ConnectionType::Http];

    /// Dense index for counter arrays
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            ConnectionType::Mtproto => 0,
            ConnectionType::Http => 1,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ConnectionType::Mtproto => "MTProto",
            ConnectionType::Http => "HTTP",
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statistics collector for connection lifecycle events
///
/// Implementations are called from connection tasks on any worker thread and
/// must not block.
pub trait StatisticsSink: Send + Sync {
    /// A connection of this type has begun
    fn connection_started(&self, ty: ConnectionType);
    /// A connection previously reported as started has ended
    fn connection_finished(&self, ty: ConnectionType);
    /// The upstream side could not be reached
    fn connection_failed(&self, ty: ConnectionType);
    /// An I/O error ended an established relay
    fn exception_caught(&self, ty: ConnectionType);
    /// Bytes moved in either direction
    fn bytes_forwarded(&self, ty: ConnectionType, bytes: u64);
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatistics;

impl StatisticsSink for NoopStatistics {
    fn connection_started(&self, _ty: ConnectionType) {}
    fn connection_finished(&self, _ty: ConnectionType) {}
    fn connection_failed(&self, _ty: ConnectionType) {}
    fn exception_caught(&self, _ty: ConnectionType) {}
    fn bytes_forwarded(&self, _ty: ConnectionType, _bytes: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_type_index_is_dense() {
        for (i, ty) in ConnectionType::ALL.iter().enumerate() {
            assert_eq!(ty.index(), i);
        }
    }

    #[test]
    fn test_connection_type_display() {
        assert_eq!(ConnectionType::Mtproto.to_string(), "MTProto");
        assert_eq!(ConnectionType::Http.to_string(), "HTTP");
    }

    #[test]
    fn test_noop_statistics_is_object_safe() {
        let sink: std::sync::Arc<dyn StatisticsSink> = std::sync::Arc::new(NoopStatistics);
        sink.connection_started(ConnectionType::Http);
        sink.bytes_forwarded(ConnectionType::Http, 10);
        sink.connection_finished(ConnectionType::Http);
    }
}
