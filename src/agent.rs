use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::{self as tokio_time, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::dial::{Connector, TcpConnector};
use crate::dispatcher::{Dispatcher, JobOutcome};
use crate::scanner::PortScanner;
use crate::scheduler;
use crate::store::ScanStore;
use crate::types::ScanId;

/// The fixed-interval driver: load settings, enqueue overdue servers, dispatch pending jobs.
pub struct Agent<C = TcpConnector> {
    store: Arc<dyn ScanStore>,
    dispatcher: Dispatcher<C>,
    tick_interval: Duration,
}

impl<C> Agent<C>
where
    C: Connector + 'static,
{
    pub fn new(store: Arc<dyn ScanStore>, scanner: PortScanner<C>, tick_interval: Duration) -> Self {
        Self {
            dispatcher: Dispatcher::new(Arc::clone(&store), scanner),
            store,
            tick_interval,
        }
    }

    /// Tick until `shutdown` is cancelled. Individual tick failures are logged and never end
    /// the loop. The first tick fires one interval after start.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker =
            tokio_time::interval_at(Instant::now() + self.tick_interval, self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.tick_interval.as_secs(), "scan agent running");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(&shutdown).await;
                }
            }
        }
        info!("scan agent stopped");
    }

    /// One scheduling pass. Returns the outcome of every job dispatched.
    pub async fn tick(&self, shutdown: &CancellationToken) -> Vec<(ScanId, JobOutcome)> {
        let settings = match self.store.get_settings().await {
            Ok(settings) => settings,
            Err(e) => {
                error!(error = %e, "error loading settings");
                return Vec::new();
            }
        };
        debug!(?settings, "tick");

        let now = OffsetDateTime::now_utc().unix_timestamp();
        if let Err(e) = scheduler::enqueue_due(self.store.as_ref(), &settings, now).await {
            error!(error = %e, "error scheduling periodic scans");
        }

        match self.dispatcher.dispatch(&settings, shutdown).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                error!(error = %e, "error fetching pending scans");
                Vec::new()
            }
        }
    }
}
