use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::ScanProgress;

/// Receives progress snapshots while a scan runs.
///
/// Returning `true` asks the engine to cancel. The observer decides *whether* to cancel
/// (it may poll a store); the engine owns how cancellation propagates.
#[async_trait]
pub trait ProgressObserver: Send + Sync {
    async fn on_progress(&self, progress: ScanProgress) -> bool;
}

#[async_trait]
impl<F> ProgressObserver for F
where
    F: Fn(ScanProgress) -> bool + Send + Sync,
{
    async fn on_progress(&self, progress: ScanProgress) -> bool {
        self(progress)
    }
}

/// Observer that never cancels and discards snapshots.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

#[async_trait]
impl ProgressObserver for NoopObserver {
    async fn on_progress(&self, _progress: ScanProgress) -> bool {
        false
    }
}

/// Lock-free scanned/open counters shared by all workers of one scan.
#[derive(Clone, Debug)]
pub struct ScanCounters {
    total: u64,
    scanned: Arc<AtomicU64>,
    open: Arc<AtomicU64>,
}

impl ScanCounters {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            scanned: Arc::new(AtomicU64::new(0)),
            open: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record_closed(&self) {
        self.scanned.fetch_add(1, Ordering::SeqCst);
    }

    /// Scanned is bumped before open so a snapshot never sees `open > scanned`.
    pub fn record_open(&self) {
        self.scanned.fetch_add(1, Ordering::SeqCst);
        self.open.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> ScanProgress {
        let open = self.open.load(Ordering::SeqCst);
        let scanned = self.scanned.load(Ordering::SeqCst);
        ScanProgress {
            total: self.total,
            scanned,
            open,
        }
    }
}

/// Ticks every `period`, hands snapshots to `observer`, and raises `cancel` once the
/// observer asks for it. Ticking stops after cancellation; when `done` fires a final
/// snapshot is always flushed before the task exits.
pub fn spawn_monitor(
    observer: Arc<dyn ProgressObserver>,
    counters: ScanCounters,
    period: Duration,
    cancel: CancellationToken,
    done: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = done.cancelled() => break,
                _ = ticker.tick(), if !cancel.is_cancelled() => {
                    if observer.on_progress(counters.snapshot()).await {
                        request_cancel(&cancel);
                    }
                }
            }
        }

        if observer.on_progress(counters.snapshot()).await {
            request_cancel(&cancel);
        }
    })
}

fn request_cancel(cancel: &CancellationToken) {
    if !cancel.is_cancelled() {
        debug!("progress observer requested cancellation");
        cancel.cancel();
    }
}
