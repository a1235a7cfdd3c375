//! Connection statistics and periodic reporting
//!
//! Tracks per connection type: connections started, currently alive, upstream
//! failures, relay exceptions and bytes forwarded.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::core::hooks::{ConnectionType, StatisticsSink};
use crate::logger::log;

const TYPE_COUNT: usize = ConnectionType::ALL.len();

/// Counters for a single connection type
#[derive(Debug, Default)]
struct TypeCounters {
    started: AtomicU64,
    /// Signed so a stray finish can never wrap around
    active: AtomicI64,
    failed: AtomicU64,
    exceptions: AtomicU64,
    bytes: AtomicU64,
}

/// Snapshot of one connection type's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub started: u64,
    pub active: i64,
    pub failed: u64,
    pub exceptions: u64,
    pub bytes_forwarded: u64,
}

impl StatsSnapshot {
    /// One report line, e.g. `connections: 3, alive: 1, ...`
    pub fn describe(&self) -> String {
        format!(
            "connections: {}, alive: {}, upstream failures: {}, exceptions: {}; traffic: {}",
            self.started,
            self.active,
            self.failed,
            self.exceptions,
            format_size(self.bytes_forwarded)
        )
    }
}

/// Lock-free statistics collector
#[derive(Debug)]
pub struct StatisticsTracker {
    counters: [TypeCounters; TYPE_COUNT],
    started_at: Instant,
}

impl Default for StatisticsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatisticsTracker {
    pub fn new() -> Self {
        Self {
            counters: Default::default(),
            started_at: Instant::now(),
        }
    }

    #[inline]
    fn counters(&self, ty: ConnectionType) -> &TypeCounters {
        &self.counters[ty.index()]
    }

    pub fn snapshot(&self, ty: ConnectionType) -> StatsSnapshot {
        let c = self.counters(ty);
        StatsSnapshot {
            started: c.started.load(Ordering::Relaxed),
            active: c.active.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            exceptions: c.exceptions.load(Ordering::Relaxed),
            bytes_forwarded: c.bytes.load(Ordering::Relaxed),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Report lines; HTTP is only broken out when a backend is configured
    pub fn report_lines(&self, report_http: bool) -> Vec<String> {
        let uptime = Duration::from_secs(self.uptime().as_secs());
        let mut lines = vec![format!("Uptime: {}", humantime::format_duration(uptime))];
        let mtproto = self.snapshot(ConnectionType::Mtproto).describe();
        if report_http {
            let http = self.snapshot(ConnectionType::Http).describe();
            lines.push(format!("MTProto statistics: {}", mtproto));
            lines.push(format!("HTTP statistics:    {}", http));
        } else {
            lines.push(format!("Traffic statistics: {}", mtproto));
        }
        lines
    }
}

impl StatisticsSink for StatisticsTracker {
    fn connection_started(&self, ty: ConnectionType) {
        let c = self.counters(ty);
        c.started.fetch_add(1, Ordering::Relaxed);
        c.active.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_finished(&self, ty: ConnectionType) {
        self.counters(ty).active.fetch_sub(1, Ordering::Relaxed);
    }

    fn connection_failed(&self, ty: ConnectionType) {
        self.counters(ty).failed.fetch_add(1, Ordering::Relaxed);
    }

    fn exception_caught(&self, ty: ConnectionType) {
        self.counters(ty).exceptions.fetch_add(1, Ordering::Relaxed);
    }

    fn bytes_forwarded(&self, ty: ConnectionType, bytes: u64) {
        self.counters(ty).bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Human-readable byte count with one decimal, e.g. `1.5 kB`
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "kB", "MB", "GB", "TB"];
    let mut count = bytes as f64;
    let mut unit = 0;
    while count >= 1024.0 && unit < UNITS.len() - 1 {
        count /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", count, UNITS[unit])
}

/// Log statistics every `interval` until `cancel` fires
///
/// A zero interval disables reporting.
pub async fn run_reporter(
    tracker: Arc<StatisticsTracker>,
    interval: Duration,
    report_http: bool,
    cancel: CancellationToken,
) {
    if interval.is_zero() {
        log::debug!("Statistics reporting disabled");
        return;
    }

    let mut ticker = tokio::time::interval(interval);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                for line in tracker.report_lines(report_http) {
                    log::info!("{}", line);
                }
            }
        }
    }
}
