use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::dial::{Connector, TcpConnector};
use crate::error::Result;
use crate::monitor::ProgressObserver;
use crate::reconciler;
use crate::scanner::PortScanner;
use crate::store::ScanStore;
use crate::types::{ScanId, ScanJob, ScanProgress, Settings};

/// How one job execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Done { open_ports: usize, new_ports: usize },
    Canceled,
    Failed(String),
    /// Left untouched (lookup or claim failed); picked up again next tick.
    Skipped,
    /// Stopped by process shutdown; stays `scanning` and is re-claimed on restart.
    Interrupted,
}

/// Runs pending jobs through the scan engine, at most `scan_concurrency` at a time.
pub struct Dispatcher<C = TcpConnector> {
    store: Arc<dyn ScanStore>,
    scanner: Arc<PortScanner<C>>,
}

impl<C> Dispatcher<C>
where
    C: Connector + 'static,
{
    pub fn new(store: Arc<dyn ScanStore>, scanner: PortScanner<C>) -> Self {
        Self {
            store,
            scanner: Arc::new(scanner),
        }
    }

    /// Execute every `queued`/`scanning` job, oldest first. Only the job listing itself can
    /// fail; everything after that is contained per job.
    pub async fn dispatch(
        &self,
        settings: &Settings,
        shutdown: &CancellationToken,
    ) -> Result<Vec<(ScanId, JobOutcome)>> {
        let jobs = self.store.list_pending_jobs().await?;
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let slots = usize::try_from(settings.scan_concurrency.max(1)).unwrap_or(1);
        let gate = Arc::new(Semaphore::new(slots));
        let mut set = JoinSet::new();
        info!(pending = jobs.len(), slots, "dispatching scan jobs");

        for job in jobs {
            if shutdown.is_cancelled() {
                break;
            }
            let Ok(permit) = Arc::clone(&gate).acquire_owned().await else {
                break;
            };
            let store = Arc::clone(&self.store);
            let scanner = Arc::clone(&self.scanner);
            let shutdown = shutdown.clone();

            set.spawn(async move {
                let _permit = permit;
                let scan_id = job.scan_id;
                (scan_id, run_job(store, scanner, job, shutdown).await)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(res) = set.join_next().await {
            match res {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "scan job task panicked"),
            }
        }
        Ok(outcomes)
    }
}

async fn run_job<C>(
    store: Arc<dyn ScanStore>,
    scanner: Arc<PortScanner<C>>,
    job: ScanJob,
    shutdown: CancellationToken,
) -> JobOutcome
where
    C: Connector + 'static,
{
    let scan_id = job.scan_id;

    let server = match store.get_server(job.server_id).await {
        Ok(server) => server,
        Err(e) => {
            warn!(scan_id, server_id = job.server_id, error = %e, "failed to load server");
            return JobOutcome::Skipped;
        }
    };

    let total_ports = job.effective_total_ports();

    match store.mark_scan_started(scan_id).await {
        Ok(true) => {}
        Ok(false) => {
            info!(scan_id, "job is no longer pending, skipping");
            return JobOutcome::Skipped;
        }
        Err(e) => {
            warn!(scan_id, error = %e, "failed to mark scan started");
            return JobOutcome::Skipped;
        }
    }

    let ip = match resolve(&server.ip).await {
        Ok(ip) => ip,
        Err(message) => {
            warn!(scan_id, host = %server.ip, %message, "cannot resolve scan target");
            if let Err(e) = store.mark_scan_error(scan_id, &message).await {
                error!(scan_id, error = %e, "failed to mark scan as failed");
            }
            return JobOutcome::Failed(message);
        }
    };

    info!(scan_id, server_id = server.id, %ip, total_ports, "scan started");
    let observer = Arc::new(JobProgress {
        store: Arc::clone(&store),
        scan_id,
    });
    let report = scanner
        .scan_with_cancel(ip, total_ports, observer, shutdown.clone())
        .await;

    if report.canceled {
        if shutdown.is_cancelled() {
            info!(scan_id, scanned = report.scanned, "scan interrupted by shutdown");
            return JobOutcome::Interrupted;
        }
        if let Err(e) = store.mark_scan_canceled(scan_id).await {
            error!(scan_id, error = %e, "failed to mark scan canceled");
        }
        info!(scan_id, scanned = report.scanned, "scan canceled");
        return JobOutcome::Canceled;
    }

    let new_ports = match reconciler::reconcile(store.as_ref(), server.id, &report.open_ports).await {
        Ok(added) => added,
        Err(e) => {
            let message = e.to_string();
            error!(scan_id, error = %message, "failed to save ports");
            if let Err(e) = store.mark_scan_error(scan_id, &message).await {
                error!(scan_id, error = %e, "failed to mark scan as failed");
            }
            return JobOutcome::Failed(message);
        }
    };

    let open_ports = report.open_ports.len();
    match store
        .mark_scan_done(scan_id, u64::from(total_ports), open_ports as u64)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            info!(scan_id, new_ports, "scan canceled before completion was recorded");
            return JobOutcome::Canceled;
        }
        Err(e) => error!(scan_id, error = %e, "failed to mark scan done"),
    }
    info!(scan_id, open_ports, new_ports, "scan finished");
    JobOutcome::Done {
        open_ports,
        new_ports,
    }
}

/// Literal addresses pass through; anything else goes to DNS and the first answer wins.
async fn resolve(host: &str) -> std::result::Result<IpAddr, String> {
    let host = host.trim();
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let mut addrs = net::lookup_host((host, 0))
        .await
        .map_err(|e| format!("failed to resolve {host}: {e}"))?;
    addrs
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| format!("no addresses found for {host}"))
}

/// Persists progress and polls the job's externally-set cancellation state on every tick.
struct JobProgress {
    store: Arc<dyn ScanStore>,
    scan_id: ScanId,
}

#[async_trait]
impl ProgressObserver for JobProgress {
    async fn on_progress(&self, progress: ScanProgress) -> bool {
        if let Err(e) = self
            .store
            .update_scan_progress(self.scan_id, progress.scanned, progress.open)
            .await
        {
            warn!(scan_id = self.scan_id, error = %e, "failed to update scan progress");
        }
        match self.store.is_scan_canceled(self.scan_id).await {
            Ok(canceled) => canceled,
            Err(e) => {
                warn!(scan_id = self.scan_id, error = %e, "failed to check scan cancel status");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_addresses_skip_dns() {
        assert_eq!(resolve(" 10.0.0.7 ").await.unwrap(), "10.0.0.7".parse::<IpAddr>().unwrap());
        assert_eq!(resolve("::1").await.unwrap(), "::1".parse::<IpAddr>().unwrap());
    }
}
