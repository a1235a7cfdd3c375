//! Connection handler
//!
//! Each accepted connection is driven through an explicit state machine:
//! `Detecting → Handshaking → ConnectingUpstream → Relaying → Closed`, with
//! HTTP connections going from `Detecting` straight to the backend dial.
//! One task owns both sockets for the whole lifetime of the connection.

use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::handshake::{read_server_handshake, CipherPair};
use crate::core::hooks::{ConnectionType, StatisticsSink};
use crate::core::relay::{CloseReason, RelayPair};
use crate::core::sniffer::{sniff, Protocol};
use crate::core::stream::{AsyncStream, BoxedStream, PrefixedStream};
use crate::core::upstream::{connect_http_backend, downstream_stream, pending_from};
use crate::core::{ConnectionId, ConnectionState, Server};
use crate::logger::log;

/// Marks a connection as started for statistics and finished on drop
struct StatsGuard {
    stats: Arc<dyn StatisticsSink>,
    ty: ConnectionType,
}

impl StatsGuard {
    fn start(stats: &Arc<dyn StatisticsSink>, ty: ConnectionType) -> Self {
        stats.connection_started(ty);
        Self {
            stats: Arc::clone(stats),
            ty,
        }
    }
}

impl Drop for StatsGuard {
    fn drop(&mut self) {
        self.stats.connection_finished(self.ty);
    }
}

/// Stand-in deadline for timeouts too large to add to `Instant::now()`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now + timeout`, saturating to a far-future instant on overflow
fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Per-connection state, each variant owning what the next stage needs
enum Step<S> {
    Detecting {
        stream: S,
        buf: BytesMut,
    },
    Handshaking {
        stream: S,
        buf: BytesMut,
    },
    ConnectingUpstream {
        stream: S,
        overflow: BytesMut,
        dc: i16,
        ciphers: CipherPair,
        guard: StatsGuard,
    },
    ConnectingBackend {
        stream: S,
        backend: String,
        peeked: BytesMut,
    },
    Relaying {
        downstream: BoxedStream,
        upstream: BoxedStream,
        guard: StatsGuard,
    },
    Closed,
}

impl<S> Step<S> {
    fn state(&self) -> ConnectionState {
        match self {
            Step::Detecting { .. } => ConnectionState::Detecting,
            Step::Handshaking { .. } => ConnectionState::Handshaking,
            Step::ConnectingUpstream { .. } | Step::ConnectingBackend { .. } => {
                ConnectionState::ConnectingUpstream
            }
            Step::Relaying { .. } => ConnectionState::Relaying,
            Step::Closed => ConnectionState::Closed,
        }
    }
}

/// Serve one accepted connection until it closes
pub async fn handle_connection<S>(server: Arc<Server>, stream: S, peer_addr: SocketAddr)
where
    S: AsyncStream + 'static,
{
    // Register connection for tracking and shutdown
    let (conn_id, cancel_token) = server.conn_manager.register(peer_addr);
    log::debug!(peer = %peer_addr, conn_id = conn_id, "Connection registered");

    // Ensure connection is unregistered when done
    let conn_manager = server.conn_manager.clone();
    let _guard = scopeguard::guard((), move |_| {
        conn_manager.unregister(conn_id);
        log::debug!(conn_id = conn_id, "Connection unregistered");
    });

    let peer = peer_addr.to_string();
    log::connection(&peer, "accepted");

    tokio::select! {
        biased;
        _ = drive(&server, stream, &peer, conn_id, &cancel_token) => {}
        _ = cancel_token.cancelled() => {
            let state = server
                .conn_manager
                .state(conn_id)
                .unwrap_or(ConnectionState::Closed);
            log::debug!(peer = %peer, state = %state, "Connection cancelled");
        }
    }

    log::connection(&peer, "closed");
}

async fn drive<S>(
    server: &Server,
    stream: S,
    peer: &str,
    conn_id: ConnectionId,
    cancel_token: &CancellationToken,
) where
    S: AsyncStream + 'static,
{
    let conn = server.conn_config;
    let handshake_deadline = deadline_after(Instant::now(), conn.handshake_timeout);

    let mut step = Step::Detecting {
        stream,
        buf: BytesMut::with_capacity(conn.buffer_size),
    };

    loop {
        server.conn_manager.set_state(conn_id, step.state());

        step = match step {
            Step::Detecting { mut stream, mut buf } => {
                let detected = tokio::time::timeout_at(
                    handshake_deadline,
                    sniff(&mut stream, &mut buf, conn.buffer_size),
                )
                .await;

                match detected {
                    Err(_) => {
                        log::debug!(peer = %peer, "Protocol detection timeout");
                        Step::Closed
                    }
                    Ok(Err(e)) => {
                        log::debug!(peer = %peer, error = %e, "Read error during protocol detection");
                        Step::Closed
                    }
                    Ok(Ok(None)) => {
                        log::debug!(peer = %peer, "Connection closed before protocol detection");
                        Step::Closed
                    }
                    Ok(Ok(Some(Protocol::Http))) => match &server.http_backend {
                        Some(backend) => Step::ConnectingBackend {
                            stream,
                            backend: backend.clone(),
                            peeked: buf,
                        },
                        None => {
                            log::debug!(peer = %peer, "HTTP connection dropped, no backend configured");
                            Step::Closed
                        }
                    },
                    Ok(Ok(Some(Protocol::Obfuscated))) => Step::Handshaking { stream, buf },
                }
            }

            Step::Handshaking { mut stream, mut buf } => {
                let guard = StatsGuard::start(&server.stats, ConnectionType::Mtproto);
                let result = tokio::time::timeout_at(
                    handshake_deadline,
                    read_server_handshake(
                        &mut stream,
                        &mut buf,
                        Some(server.secret.clone()),
                        conn.buffer_size,
                    ),
                )
                .await;

                match result {
                    Err(_) => {
                        log::handshake(peer, Some("timeout"));
                        Step::Closed
                    }
                    Ok(Err(e)) => {
                        log::handshake(peer, Some(&e.to_string()));
                        Step::Closed
                    }
                    Ok(Ok(established)) => {
                        log::handshake(peer, None);
                        Step::ConnectingUpstream {
                            stream,
                            overflow: buf,
                            dc: established.dc,
                            ciphers: established.ciphers,
                            guard,
                        }
                    }
                }
            }

            Step::ConnectingUpstream {
                stream,
                overflow,
                dc,
                ciphers,
                guard,
            } => match server.upstream.connect(dc).await {
                Ok(upstream) => {
                    log::upstream(peer, &upstream.peer.address(), dc, None);
                    let downstream = downstream_stream(
                        stream,
                        pending_from(overflow.freeze()),
                        ciphers,
                        conn.buffer_size,
                    );
                    Step::Relaying {
                        downstream: Box::pin(downstream),
                        upstream: Box::pin(upstream.stream),
                        guard,
                    }
                }
                Err(e) => {
                    let target = server.upstream.selector().select(dc).address();
                    log::upstream(peer, &target, dc, Some(&e.to_string()));
                    server.stats.connection_failed(ConnectionType::Mtproto);
                    Step::Closed
                }
            },

            Step::ConnectingBackend {
                stream,
                backend,
                peeked,
            } => match connect_http_backend(&backend, &conn).await {
                Ok(backend_stream) => {
                    log::debug!(peer = %peer, backend = %backend, "Connected to HTTP backend");
                    let guard = StatsGuard::start(&server.stats, ConnectionType::Http);
                    // The sniffed bytes go out first
                    Step::Relaying {
                        downstream: Box::pin(PrefixedStream::new(stream, peeked.freeze())),
                        upstream: Box::pin(backend_stream),
                        guard,
                    }
                }
                Err(e) => {
                    log::info!(peer = %peer, backend = %backend, error = %e, "Failed to connect to HTTP backend");
                    Step::Closed
                }
            },

            Step::Relaying {
                downstream,
                upstream,
                guard,
            } => {
                let relay = RelayPair::new(downstream, upstream)
                    .with_idle_timeout(conn.idle_timeout)
                    .with_buffer_size(conn.buffer_size)
                    .with_stats(guard.ty, Arc::clone(&server.stats));
                let handle = relay.handle();
                let run = relay.run();
                tokio::pin!(run);

                let outcome = tokio::select! {
                    biased;
                    outcome = &mut run => outcome,
                    _ = cancel_token.cancelled() => {
                        handle.close();
                        run.await
                    }
                };

                match &outcome.reason {
                    CloseReason::Finished => {
                        log::debug!(peer = %peer, up = outcome.a_to_b, down = outcome.b_to_a, "Relay completed");
                    }
                    CloseReason::IdleTimeout => {
                        log::debug!(peer = %peer, up = outcome.a_to_b, down = outcome.b_to_a, "Connection idle timeout");
                    }
                    CloseReason::Closed => {
                        log::debug!(peer = %peer, initiated = outcome.initiated_close, "Relay closed");
                    }
                    CloseReason::Error(e) => {
                        log::warn!(peer = %peer, kind = %guard.ty, error = %e, "Relay error");
                    }
                }

                drop(guard);
                Step::Closed
            }

            Step::Closed => return,
        };
    }
}
