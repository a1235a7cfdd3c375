//! Bidirectional relay with symmetric close
//!
//! A [`RelayPair`] pumps bytes A→B and B→A until either side reaches EOF,
//! fails, stays idle for too long, or someone calls [`RelayHandle::close`].
//! Whatever the trigger, the close sequence (dropping both streams) runs
//! exactly once.

use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;

use super::hooks::{ConnectionType, StatisticsSink};

/// Default per-direction copy buffer
pub const DEFAULT_RELAY_BUFFER: usize = 16 * 1024;

/// Upper bound on how often idleness is checked
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

pin_project! {
    /// A stream wrapper that tracks the last activity time and bytes transferred
    struct TimedStream<S> {
        #[pin]
        inner: S,
        start_time: Instant,
        // Milliseconds since start_time
        last_activity: Arc<AtomicU64>,
        read_bytes: Arc<AtomicU64>,
    }
}

impl<S> TimedStream<S> {
    fn new(
        inner: S,
        start_time: Instant,
        last_activity: Arc<AtomicU64>,
        read_bytes: Arc<AtomicU64>,
    ) -> Self {
        Self {
            inner,
            start_time,
            last_activity,
            read_bytes,
        }
    }
}

fn elapsed_millis(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

impl<S: AsyncRead> AsyncRead for TimedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before_len = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let bytes_read = buf.filled().len() - before_len;
            if bytes_read > 0 {
                this.last_activity
                    .store(elapsed_millis(*this.start_time), Ordering::Release);
                this.read_bytes
                    .fetch_add(bytes_read as u64, Ordering::Relaxed);
            }
        }
        result
    }
}

impl<S: AsyncWrite> AsyncWrite for TimedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let result = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 {
                this.last_activity
                    .store(elapsed_millis(*this.start_time), Ordering::Release);
            }
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

struct CloseSignal {
    closed: AtomicBool,
    token: CancellationToken,
}

/// Cloneable trigger for closing a running [`RelayPair`]
#[derive(Clone)]
pub struct RelayHandle {
    signal: Arc<CloseSignal>,
}

impl RelayHandle {
    fn new(token: CancellationToken) -> Self {
        Self {
            signal: Arc::new(CloseSignal {
                closed: AtomicBool::new(false),
                token,
            }),
        }
    }

    /// Request the pair to close
    ///
    /// Returns `true` only for the call that actually started the close; every
    /// later or concurrent call returns `false`.
    pub fn close(&self) -> bool {
        if self.signal.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.signal.token.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.signal.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Why a relay ended
#[derive(Debug)]
pub enum CloseReason {
    /// One side reached EOF
    Finished,
    /// No bytes moved for the idle timeout
    IdleTimeout,
    /// Closed through a [`RelayHandle`]
    Closed,
    /// Read or write failed on either side
    Error(io::Error),
}

/// Result of a finished relay
#[derive(Debug)]
pub struct RelayOutcome {
    /// Bytes read from A and written to B
    pub a_to_b: u64,
    /// Bytes read from B and written to A
    pub b_to_a: u64,
    pub reason: CloseReason,
    /// Whether this relay's own termination ran the close sequence, as
    /// opposed to an external [`RelayHandle::close`] that got there first
    pub initiated_close: bool,
}

/// Two streams relayed into each other
pub struct RelayPair<A, B> {
    a: A,
    b: B,
    idle_timeout: Option<Duration>,
    buffer_size: usize,
    stats: Option<(ConnectionType, Arc<dyn StatisticsSink>)>,
    handle: RelayHandle,
}

impl<A, B> RelayPair<A, B>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(a: A, b: B) -> Self {
        Self {
            a,
            b,
            idle_timeout: None,
            buffer_size: DEFAULT_RELAY_BUFFER,
            stats: None,
            handle: RelayHandle::new(CancellationToken::new()),
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = Some(idle_timeout);
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Report forwarded bytes and relay errors under `ty`
    pub fn with_stats(mut self, ty: ConnectionType, sink: Arc<dyn StatisticsSink>) -> Self {
        self.stats = Some((ty, sink));
        self
    }

    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    /// Relay until one side ends, then close both sides once
    pub async fn run(self) -> RelayOutcome {
        let RelayPair {
            a,
            b,
            idle_timeout,
            buffer_size,
            stats,
            handle,
        } = self;

        let start_time = Instant::now();
        let last_activity = Arc::new(AtomicU64::new(0));
        let a_to_b = Arc::new(AtomicU64::new(0));
        let b_to_a = Arc::new(AtomicU64::new(0));

        // Reads from A travel to B, reads from B travel to A
        let a = TimedStream::new(a, start_time, Arc::clone(&last_activity), Arc::clone(&a_to_b));
        let b = TimedStream::new(b, start_time, Arc::clone(&last_activity), Arc::clone(&b_to_a));
        let (mut a_read, mut a_write) = tokio::io::split(a);
        let (mut b_read, mut b_write) = tokio::io::split(b);

        let stats_ref = stats.as_ref().map(|(ty, sink)| (*ty, sink.as_ref()));
        let token = handle.signal.token.clone();

        let idle_check = async {
            let Some(idle_timeout) = idle_timeout else {
                return std::future::pending::<()>().await;
            };
            let idle_millis = idle_timeout.as_millis() as u64;
            let period = (idle_timeout / 2)
                .min(IDLE_CHECK_INTERVAL)
                .max(Duration::from_millis(10));
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let last_active = last_activity.load(Ordering::Acquire);
                let idle = elapsed_millis(start_time).saturating_sub(last_active);
                if idle >= idle_millis {
                    return;
                }
            }
        };

        let reason = tokio::select! {
            biased;
            _ = token.cancelled() => CloseReason::Closed,
            result = pipe(&mut a_read, &mut b_write, buffer_size, stats_ref) => into_reason(result),
            result = pipe(&mut b_read, &mut a_write, buffer_size, stats_ref) => into_reason(result),
            _ = idle_check => CloseReason::IdleTimeout,
        };

        let initiated_close = handle.close();

        drop(a_read);
        drop(a_write);
        drop(b_read);
        drop(b_write);

        if let (CloseReason::Error(_), Some((ty, sink))) = (&reason, &stats) {
            sink.exception_caught(*ty);
        }

        RelayOutcome {
            a_to_b: a_to_b.load(Ordering::Relaxed),
            b_to_a: b_to_a.load(Ordering::Relaxed),
            reason,
            initiated_close,
        }
    }
}

fn into_reason(result: io::Result<()>) -> CloseReason {
    match result {
        Ok(()) => CloseReason::Finished,
        Err(e) => CloseReason::Error(e),
    }
}

/// Copy one direction; each chunk is fully written and flushed before the
/// next read, so at most `buffer_size` bytes are in flight per direction
async fn pipe<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    stats: Option<(ConnectionType, &dyn StatisticsSink)>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        if let Some((ty, sink)) = stats {
            sink.bytes_forwarded(ty, n as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::StatisticsTracker;
    use std::io::Cursor;
    use tokio::io::DuplexStream;

    /// Returns (relay, outer end of A, outer end of B)
    fn duplex_pair() -> (RelayPair<DuplexStream, DuplexStream>, DuplexStream, DuplexStream) {
        let (a_outer, a_inner) = tokio::io::duplex(4096);
        let (b_outer, b_inner) = tokio::io::duplex(4096);
        (RelayPair::new(a_inner, b_inner), a_outer, b_outer)
    }

    #[tokio::test]
    async fn test_timed_stream_read_updates_activity() {
        let cursor = Cursor::new(b"hello world".to_vec());
        let start_time = Instant::now();
        let last_activity = Arc::new(AtomicU64::new(0));
        let read_bytes = Arc::new(AtomicU64::new(0));

        let mut stream = TimedStream::new(
            cursor,
            start_time,
            Arc::clone(&last_activity),
            read_bytes.clone(),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut buf = [0u8; 5];
        let n = stream.read(&mut buf).await.unwrap();

        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(read_bytes.load(Ordering::Relaxed), 5);
        assert!(last_activity.load(Ordering::Acquire) >= 20);
    }

    #[tokio::test]
    async fn test_timed_stream_write_updates_activity() {
        let start_time = Instant::now();
        let last_activity = Arc::new(AtomicU64::new(0));
        let mut stream = TimedStream::new(
            Cursor::new(Vec::new()),
            start_time,
            Arc::clone(&last_activity),
            Arc::new(AtomicU64::new(0)),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(stream.write(b"test").await.unwrap(), 4);
        assert!(last_activity.load(Ordering::Acquire) >= 20);

        stream.flush().await.unwrap();
        stream.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_forwards_both_directions() {
        let (relay, mut a, mut b) = duplex_pair();
        let task = tokio::spawn(relay.run());

        a.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        b.write_all(b"world!").await.unwrap();
        let mut buf = [0u8; 6];
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world!");

        drop(a);
        let outcome = task.await.unwrap();
        assert!(matches!(outcome.reason, CloseReason::Finished));
        assert!(outcome.initiated_close);
        assert_eq!(outcome.a_to_b, 5);
        assert_eq!(outcome.b_to_a, 6);

        // B observes the close
        let mut rest = Vec::new();
        b.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_relay_preserves_order() {
        let (relay, mut a, mut b) = duplex_pair();
        let task = tokio::spawn(relay.with_buffer_size(7).run());

        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            for chunk in payload.chunks(333) {
                a.write_all(chunk).await.unwrap();
            }
            a
        });

        let mut received = vec![0u8; expected.len()];
        b.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);

        drop(writer.await.unwrap());
        let outcome = task.await.unwrap();
        assert_eq!(outcome.a_to_b, expected.len() as u64);
    }

    #[tokio::test]
    async fn test_close_runs_exactly_once_under_concurrent_triggers() {
        for _ in 0..20 {
            let (relay, mut a, mut b) = duplex_pair();
            let handle = relay.handle();
            let task = tokio::spawn(relay.run());

            let barrier = Arc::new(tokio::sync::Barrier::new(8));
            let closers: Vec<_> = (0..8)
                .map(|_| {
                    let handle = handle.clone();
                    let barrier = Arc::clone(&barrier);
                    tokio::spawn(async move {
                        barrier.wait().await;
                        handle.close()
                    })
                })
                .collect();

            let mut wins = 0;
            for closer in closers {
                if closer.await.unwrap() {
                    wins += 1;
                }
            }

            let outcome = task.await.unwrap();
            if outcome.initiated_close {
                wins += 1;
            }
            assert_eq!(wins, 1, "close sequence must run exactly once");
            assert!(handle.is_closed());
            assert!(!handle.close());

            // Both far ends see EOF
            let mut buf = Vec::new();
            a.read_to_end(&mut buf).await.unwrap();
            b.read_to_end(&mut buf).await.unwrap();
            assert!(buf.is_empty());
        }
    }

    #[tokio::test]
    async fn test_close_racing_with_eof() {
        for _ in 0..20 {
            let (relay, a, _b) = duplex_pair();
            let handle = relay.handle();
            let task = tokio::spawn(relay.run());

            let closer = tokio::spawn(async move { handle.close() });
            drop(a);

            let external = closer.await.unwrap();
            let outcome = task.await.unwrap();
            assert!(external ^ outcome.initiated_close);
        }
    }

    #[tokio::test]
    async fn test_relay_idle_timeout() {
        let (relay, _a, _b) = duplex_pair();
        let started = Instant::now();
        let outcome = relay
            .with_idle_timeout(Duration::from_millis(100))
            .run()
            .await;

        assert!(matches!(outcome.reason, CloseReason::IdleTimeout));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_relay_closed_by_handle() {
        let (relay, mut a, _b) = duplex_pair();
        let handle = relay.handle();
        let task = tokio::spawn(relay.run());

        assert!(handle.close());
        let outcome = task.await.unwrap();
        assert!(matches!(outcome.reason, CloseReason::Closed));
        assert!(!outcome.initiated_close);

        let mut buf = Vec::new();
        a.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_relay_reports_bytes() {
        let tracker = Arc::new(StatisticsTracker::new());
        let (relay, mut a, mut b) = duplex_pair();
        let task = tokio::spawn(
            relay
                .with_stats(ConnectionType::Http, tracker.clone())
                .run(),
        );

        a.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        b.read_exact(&mut buf).await.unwrap();
        b.write_all(b"de").await.unwrap();
        let mut buf = [0u8; 2];
        a.read_exact(&mut buf).await.unwrap();

        drop(b);
        task.await.unwrap();

        let snapshot = tracker.snapshot(ConnectionType::Http);
        assert_eq!(snapshot.bytes_forwarded, 5);
        assert_eq!(snapshot.exceptions, 0);
        assert_eq!(tracker.snapshot(ConnectionType::Mtproto).bytes_forwarded, 0);
    }

    /// Never yields data and rejects every write
    struct BrokenPipe;

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_relay_write_error_counts_exception() {
        let tracker = Arc::new(StatisticsTracker::new());
        let (a, mut a_outer) = tokio::io::duplex(64);
        let task = tokio::spawn(
            RelayPair::new(a, BrokenPipe)
                .with_stats(ConnectionType::Mtproto, tracker.clone())
                .run(),
        );

        a_outer.write_all(b"data").await.unwrap();
        let outcome = task.await.unwrap();

        match outcome.reason {
            CloseReason::Error(e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected close reason: {:?}", other),
        }
        assert!(outcome.initiated_close);
        assert_eq!(tracker.snapshot(ConnectionType::Mtproto).exceptions, 1);
    }
}
