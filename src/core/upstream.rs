//! Upstream connection setup
//!
//! After the client's handshake the downstream socket is not read again
//! until the upstream is ready. Bytes that arrived together with the
//! handshake are parked in a [`PendingBuffer`] and replayed through the
//! downstream cipher ahead of anything read later.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::handshake::{write_client_handshake, CipherPair};
use super::peer::{PeerRecord, PeerSelector};
use super::stream::{ObfuscatedStream, PendingBuffer, PrefixedStream};
use crate::config::ConnConfig;
use crate::error::{ProxyError, Result};

/// An established, handshaken connection to a peer
pub struct Upstream {
    pub peer: PeerRecord,
    pub stream: ObfuscatedStream<TcpStream>,
}

/// Dials peers selected by datacenter number
#[derive(Debug, Clone)]
pub struct UpstreamConnector {
    selector: PeerSelector,
    conn: ConnConfig,
}

impl UpstreamConnector {
    pub fn new(selector: PeerSelector, conn: ConnConfig) -> Self {
        Self { selector, conn }
    }

    pub fn selector(&self) -> &PeerSelector {
        &self.selector
    }

    /// Connect to the peer for `dc` and send the client-role handshake
    ///
    /// The whole step, including flushing the 64 handshake bytes, is bounded
    /// by the connect timeout. No retry.
    pub async fn connect(&self, dc: i16) -> Result<Upstream> {
        let peer = self.selector.select(dc).clone();

        let stream = tokio::time::timeout(self.conn.connect_timeout, self.dial(&peer, dc))
            .await
            .map_err(|_| ProxyError::Timeout("peer connect"))??;

        Ok(Upstream { peer, stream })
    }

    async fn dial(&self, peer: &PeerRecord, dc: i16) -> Result<ObfuscatedStream<TcpStream>> {
        let connect_error = |source| ProxyError::PeerConnect {
            addr: peer.address(),
            source,
        };

        let mut stream = TcpStream::connect((peer.host(), peer.port()))
            .await
            .map_err(connect_error)?;
        if self.conn.tcp_nodelay {
            let _ = stream.set_nodelay(true);
        }

        let ciphers = write_client_handshake(&mut stream, peer.secret().cloned(), dc)
            .await
            .map_err(connect_error)?;

        Ok(ObfuscatedStream::with_write_limit(
            stream,
            ciphers,
            self.conn.buffer_size,
        ))
    }
}

/// Wrap the downstream socket for relaying
///
/// `pending` holds still-encrypted client bytes; they are decrypted first,
/// in order, then reads continue from the socket.
pub fn downstream_stream<S>(
    stream: S,
    pending: PendingBuffer,
    ciphers: CipherPair,
    write_limit: usize,
) -> ObfuscatedStream<PrefixedStream<S>>
where
    S: AsyncRead + AsyncWrite,
{
    ObfuscatedStream::with_write_limit(
        PrefixedStream::new(stream, pending.into_bytes()),
        ciphers,
        write_limit,
    )
}

/// Dial the HTTP fallback backend
pub async fn connect_http_backend(addr: &str, conn: &ConnConfig) -> Result<TcpStream> {
    let stream = tokio::time::timeout(conn.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ProxyError::Timeout("HTTP backend connect"))?
        .map_err(|source| ProxyError::PeerConnect {
            addr: addr.to_string(),
            source,
        })?;
    if conn.tcp_nodelay {
        let _ = stream.set_nodelay(true);
    }
    Ok(stream)
}

/// Raw downstream bytes still sitting in a read buffer
pub fn pending_from(overflow: Bytes) -> PendingBuffer {
    let mut pending = PendingBuffer::new();
    pending.push(overflow);
    pending
}
