//! Progress reporting, byte counters and cooperative cancellation.

use crate::error::{SyncError, SyncResult};
use crate::state::SyncPhase;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Receives progress notifications. All methods default to no-ops.
pub trait ProgressSink: Send + Sync {
    /// A new phase started.
    fn phase(&self, _phase: SyncPhase) {}

    /// Byte totals crossed a reporting boundary.
    fn transfer(&self, _sent: u64, _received: u64) {}

    /// Media files applied so far in this run.
    fn media(&self, _downloaded: u64, _uploaded: u64) {}
}

/// A sink that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {}

/// Running byte totals for one client, shared with the caller.
#[derive(Debug, Default)]
pub struct TransferCounters {
    sent: AtomicU64,
    received: AtomicU64,
}

impl TransferCounters {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written to the network.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Bytes read from the network.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Zeroes both counters.
    pub fn reset(&self) {
        self.sent.store(0, Ordering::Relaxed);
        self.received.store(0, Ordering::Relaxed);
    }
}

/// Cooperative cancellation flag, cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fails with [`SyncError::Cancelled`] once cancellation was requested.
    pub fn check(&self) -> SyncResult<()> {
        if self.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Marker error carried inside `io::Error` when a transfer is cancelled.
#[derive(Error, Debug)]
#[error("transfer cancelled")]
pub struct TransferCancelled;

/// Builds the I/O error returned by a cancelled transfer.
pub(crate) fn cancelled_io_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, TransferCancelled)
}

/// Returns true if `err` came from a cancelled transfer.
pub(crate) fn is_cancellation(err: &io::Error) -> bool {
    err.get_ref()
        .is_some_and(|inner| inner.is::<TransferCancelled>())
}

/// Everything a transfer needs to report progress and observe cancellation.
#[derive(Clone)]
pub struct Monitor {
    counters: Arc<TransferCounters>,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
    granularity: u64,
}

impl Monitor {
    /// Creates a monitor reporting every `granularity` bytes.
    pub fn new(
        counters: Arc<TransferCounters>,
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
        granularity: u64,
    ) -> Self {
        Self {
            counters,
            sink,
            cancel,
            granularity: granularity.max(1),
        }
    }

    /// A monitor with fresh counters, no sink and no cancellation.
    pub fn detached() -> Self {
        Self::new(
            Arc::new(TransferCounters::new()),
            Arc::new(NoProgress),
            CancellationToken::new(),
            1024,
        )
    }

    /// The shared counters.
    pub fn counters(&self) -> &Arc<TransferCounters> {
        &self.counters
    }

    /// The sink.
    pub fn sink(&self) -> &dyn ProgressSink {
        self.sink.as_ref()
    }

    /// The cancellation token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fails once cancellation was requested.
    pub fn check_cancelled(&self) -> SyncResult<()> {
        self.cancel.check()
    }

    /// Adds sent bytes, notifying the sink on a boundary crossing.
    pub fn record_sent(&self, n: u64) {
        let before = self.counters.sent.fetch_add(n, Ordering::Relaxed);
        self.notify_if_crossed(before, before + n);
    }

    /// Adds received bytes, notifying the sink on a boundary crossing.
    pub fn record_received(&self, n: u64) {
        let before = self.counters.received.fetch_add(n, Ordering::Relaxed);
        self.notify_if_crossed(before, before + n);
    }

    fn notify_if_crossed(&self, before: u64, after: u64) {
        if before / self.granularity != after / self.granularity {
            self.sink
                .transfer(self.counters.sent(), self.counters.received());
        }
    }

    /// Wraps a reader whose bytes count as sent.
    pub fn upload<R: Read>(&self, inner: R) -> ProgressReader<R> {
        ProgressReader {
            inner,
            monitor: self.clone(),
            direction: Direction::Sent,
        }
    }

    /// Wraps a reader whose bytes count as received.
    pub fn download<R: Read>(&self, inner: R) -> ProgressReader<R> {
        ProgressReader {
            inner,
            monitor: self.clone(),
            direction: Direction::Received,
        }
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("counters", &self.counters)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("granularity", &self.granularity)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Sent,
    Received,
}

/// A reader that counts bytes and aborts once cancelled.
pub struct ProgressReader<R> {
    inner: R,
    monitor: Monitor,
    direction: Direction,
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.monitor.cancel.is_cancelled() {
            return Err(cancelled_io_error());
        }
        let n = self.inner.read(buf)?;
        match self.direction {
            Direction::Sent => self.monitor.record_sent(n as u64),
            Direction::Received => self.monitor.record_received(n as u64),
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(u64, u64)>>);

    impl ProgressSink for Recorder {
        fn transfer(&self, sent: u64, received: u64) {
            self.0.lock().push((sent, received));
        }
    }

    #[test]
    fn reports_on_kilobyte_boundaries() {
        let sink = Arc::new(Recorder::default());
        let monitor = Monitor::new(
            Arc::new(TransferCounters::new()),
            sink.clone(),
            CancellationToken::new(),
            1024,
        );
        monitor.record_sent(1000);
        assert!(sink.0.lock().is_empty());
        monitor.record_sent(100);
        monitor.record_sent(100);
        monitor.record_received(3000);
        let calls = sink.0.lock().clone();
        assert_eq!(calls, vec![(1100, 0), (1200, 3000)]);
    }

    #[test]
    fn one_report_per_read_even_across_many_boundaries() {
        let sink = Arc::new(Recorder::default());
        let monitor = Monitor::new(
            Arc::new(TransferCounters::new()),
            sink.clone(),
            CancellationToken::new(),
            1024,
        );
        let data = vec![7u8; 10_000];
        let mut reader = monitor.download(&data[..]);
        let mut buf = vec![0u8; 10_000];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(n, 10_000);
        assert_eq!(sink.0.lock().len(), 1);
        assert_eq!(monitor.counters().received(), 10_000);
    }

    #[test]
    fn cancelled_reader_fails() {
        let monitor = Monitor::detached();
        let data = [1u8; 16];
        let mut reader = monitor.upload(&data[..]);
        monitor.cancel_token().cancel();
        let err = reader.read(&mut [0u8; 16]).unwrap_err();
        assert!(is_cancellation(&err));
        assert!(matches!(monitor.check_cancelled(), Err(SyncError::Cancelled)));
    }

    #[test]
    fn token_clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
