//! Obfuscated MTProto relay with HTTP fallback
//!
//! Two runtimes: a small acceptor runtime owns the listening sockets and a
//! worker runtime owns every accepted connection.

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{anyhow, Result};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio_util::sync::CancellationToken;

use mtproxy_relay::config::{CliArgs, ProxyConfig};
use mtproxy_relay::core::{ConnectionManager, Server, StatisticsSink};
use mtproxy_relay::logger::{self, log};
use mtproxy_relay::server_runner::{accept_loop, bind_listener, wait_for_shutdown_signal};
use mtproxy_relay::stats::{run_reporter, StatisticsTracker};

/// Exit status for unusable configuration
const EXIT_CONFIG_ERROR: u8 = 2;

/// Time given to connection tasks to observe cancellation
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

fn main() -> ExitCode {
    // Parse CLI arguments
    let cli = CliArgs::parse_args();
    if let Err(e) = cli.validate() {
        eprintln!("{}", e);
        return ExitCode::from(EXIT_CONFIG_ERROR);
    }

    let config = match ProxyConfig::load(&cli.config_file) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    // CLI level wins over the config file
    logger::init_logger(cli.log_level().or(config.log_level));

    log::info!(
        config_file = %cli.config_file.display(),
        "Starting MTProto relay"
    );
    config.log_summary();

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!(error = %e, "Relay stopped with error");
            ExitCode::FAILURE
        }
    }
}

fn build_runtime(name: &str, threads: usize) -> Result<Runtime> {
    Builder::new_multi_thread()
        .worker_threads(threads)
        .thread_name(name)
        .enable_all()
        .build()
        .map_err(|e| anyhow!("Failed to build {} runtime: {}", name, e))
}

fn run(config: ProxyConfig) -> Result<()> {
    let worker = build_runtime("mtproxy-worker", config.worker_threads)?;
    let acceptor = build_runtime("mtproxy-acceptor", config.acceptor_threads)?;

    // Cancels accept loops and the reporter; connection tokens hang off it too
    let shutdown = CancellationToken::new();

    let tracker = Arc::new(StatisticsTracker::new());
    let conn_manager = ConnectionManager::with_shutdown(shutdown.child_token());

    let server = Arc::new(Server::from_config(
        &config,
        Arc::clone(&tracker) as Arc<dyn StatisticsSink>,
        conn_manager.clone(),
    )?);

    worker.spawn(run_reporter(
        Arc::clone(&tracker),
        config.statistics_report_interval,
        server.http_backend.is_some(),
        shutdown.clone(),
    ));

    // Listeners register with the acceptor runtime's reactor
    let listeners = acceptor.block_on(async {
        config
            .listen_addresses
            .iter()
            .map(|addr| {
                bind_listener(*addr, config.conn.tcp_backlog)
                    .map_err(|e| anyhow!("Failed to bind {}: {}", addr, e))
            })
            .collect::<Result<Vec<_>>>()
    })?;

    for listener in listeners {
        acceptor.spawn(accept_loop(
            listener,
            Arc::clone(&server),
            worker.handle().clone(),
            shutdown.clone(),
        ));
    }

    acceptor.block_on(wait_for_shutdown_signal())?;

    for conn in conn_manager.snapshots() {
        log::debug!(
            conn_id = conn.id,
            peer = %conn.peer_addr,
            state = %conn.state,
            age = %humantime::format_duration(Duration::from_secs(conn.age.as_secs())),
            "Closing connection"
        );
    }
    let active = conn_manager.shutdown_all();
    shutdown.cancel();
    log::info!(active_connections = active, "Closing connections");

    acceptor.shutdown_timeout(SHUTDOWN_GRACE);
    worker.shutdown_timeout(SHUTDOWN_GRACE);
    log::info!("Shutdown complete");
    Ok(())
}
