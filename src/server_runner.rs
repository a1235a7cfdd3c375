//! Listener setup and accept loop

use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::core::Server;
use crate::handler::handle_connection;
use crate::logger::log;

/// TCP keepalive interval in seconds
pub const TCP_KEEPALIVE_SECS: u64 = 15;

/// Pause after a failed accept so fd exhaustion does not spin the loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Bind a listening socket with SO_REUSEADDR and the configured backlog
///
/// Must be called from within a Tokio runtime; the listener is registered
/// with that runtime's reactor.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    // Allow immediate rebind after restart (skip TIME_WAIT)
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        // Keep v4 and v6 listeners on the same port independent
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    TcpListener::from_std(socket.into())
}

/// Apply per-connection socket options
fn configure_socket(stream: &TcpStream, nodelay: bool) {
    if nodelay {
        let _ = stream.set_nodelay(true);
    }

    // Detect dead peers (mobile disconnect, network change, etc.)
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(TCP_KEEPALIVE_SECS))
        .with_interval(Duration::from_secs(TCP_KEEPALIVE_SECS));
    let _ = SockRef::from(stream).set_tcp_keepalive(&keepalive);
}

/// Accept connections until `shutdown` fires
///
/// Accepted sockets are detached from the acceptor runtime and handed to
/// `worker`, which owns them for the rest of their life.
pub async fn accept_loop(
    listener: TcpListener,
    server: Arc<Server>,
    worker: Handle,
    shutdown: CancellationToken,
) {
    let local_addr = listener
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    log::info!(address = %local_addr, "Listening");

    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                configure_socket(&stream, server.conn_config.tcp_nodelay);

                let std_stream = match stream.into_std() {
                    Ok(std_stream) => std_stream,
                    Err(e) => {
                        log::warn!(peer = %peer_addr, error = %e, "Failed to detach accepted socket");
                        continue;
                    }
                };

                let server = Arc::clone(&server);
                worker.spawn(async move {
                    match TcpStream::from_std(std_stream) {
                        Ok(stream) => handle_connection(server, stream, peer_addr).await,
                        Err(e) => {
                            log::warn!(peer = %peer_addr, error = %e, "Failed to register accepted socket");
                        }
                    }
                });
            }
            Err(e) => {
                log::error!(address = %local_addr, error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }

    log::info!(address = %local_addr, "Listener stopped");
}

/// Resolve once SIGINT or SIGTERM arrives
pub async fn wait_for_shutdown_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                log::info!("SIGINT received, shutting down...");
            }
            _ = sigterm.recv() => {
                log::info!("SIGTERM received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        log::info!("Shutdown signal received...");
    }

    Ok(())
}
