use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ScanConfig;
use crate::dial::{self, Connector, TcpConnector};
use crate::monitor::{self, ProgressObserver, ScanCounters};
use crate::types::ScanReport;

/// Full TCP connect scan of ports `1..=total_ports` on a single host.
///
/// - A fixed pool of workers drains a bounded port queue filled by one feeder task.
/// - Each port is dialed through [`dial::probe`], retrying only transient failures.
/// - A monitor task reports progress to a [`ProgressObserver`] and raises cancellation
///   when the observer asks for it.
/// - Open ports are collected as they are found and returned sorted.
#[derive(Debug)]
pub struct PortScanner<C = TcpConnector> {
    config: ScanConfig,
    connector: Arc<C>,
}

impl PortScanner<TcpConnector> {
    pub fn new(config: ScanConfig) -> Self {
        Self::with_connector(config, TcpConnector)
    }
}

impl<C> PortScanner<C>
where
    C: Connector + 'static,
{
    pub fn with_connector(config: ScanConfig, connector: C) -> Self {
        Self {
            config,
            connector: Arc::new(connector),
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub async fn scan(
        &self,
        ip: IpAddr,
        total_ports: u16,
        observer: Arc<dyn ProgressObserver>,
    ) -> ScanReport {
        self.scan_with_cancel(ip, total_ports, observer, CancellationToken::new())
            .await
    }

    /// Variant whose cancellation is also raised when `parent` is cancelled
    /// (process shutdown, for instance).
    pub async fn scan_with_cancel(
        &self,
        ip: IpAddr,
        total_ports: u16,
        observer: Arc<dyn ProgressObserver>,
        parent: CancellationToken,
    ) -> ScanReport {
        let cancel = parent.child_token();
        let done = CancellationToken::new();
        let counters = ScanCounters::new(u64::from(total_ports));

        if total_ports == 0 {
            observer.on_progress(counters.snapshot()).await;
            return ScanReport {
                open_ports: Vec::new(),
                canceled: cancel.is_cancelled(),
                scanned: 0,
            };
        }

        let workers = self.config.workers_for(total_ports);
        let queue_capacity = workers * self.config.queue_slots_per_worker.max(1);
        let (ports_tx, ports_rx) = mpsc::channel::<u16>(queue_capacity);
        let (results_tx, mut results_rx) = mpsc::channel::<u16>(workers * 2);
        let ports_rx = Arc::new(Mutex::new(ports_rx));

        debug!(%ip, total_ports, workers, queue_capacity, "starting port scan");

        let monitor = monitor::spawn_monitor(
            observer,
            counters.clone(),
            self.config.progress_interval,
            cancel.clone(),
            done.clone(),
        );

        let feeder_cancel = cancel.clone();
        let feeder = tokio::spawn(async move {
            for port in 1..=total_ports {
                tokio::select! {
                    biased;
                    _ = feeder_cancel.cancelled() => break,
                    sent = ports_tx.send(port) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            // dropping the sender closes the queue
        });

        let policy = self.config.dial_policy();
        let mut set = JoinSet::new();
        for _ in 0..workers {
            let ports_rx = Arc::clone(&ports_rx);
            let results_tx = results_tx.clone();
            let counters = counters.clone();
            let cancel = cancel.clone();
            let connector = Arc::clone(&self.connector);

            set.spawn(async move {
                loop {
                    let next = ports_rx.lock().await.recv().await;
                    let Some(port) = next else { break };

                    if cancel.is_cancelled() {
                        return;
                    }

                    let addr = SocketAddr::new(ip, port);
                    if dial::probe(connector.as_ref(), addr, &policy, &cancel).await {
                        tokio::select! {
                            sent = results_tx.send(port) => {
                                if sent.is_err() {
                                    return;
                                }
                            }
                            _ = cancel.cancelled() => return,
                        }
                        counters.record_open();
                    } else {
                        counters.record_closed();
                    }
                }
            });
        }
        drop(ports_rx);
        drop(results_tx);

        let mut open_ports = Vec::new();
        while let Some(port) = results_rx.recv().await {
            open_ports.push(port);
        }

        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                warn!(%ip, error = %e, "scan worker terminated abnormally");
            }
        }
        if let Err(e) = feeder.await {
            warn!(%ip, error = %e, "port feeder terminated abnormally");
        }

        done.cancel();
        if let Err(e) = monitor.await {
            warn!(%ip, error = %e, "progress monitor terminated abnormally");
        }

        open_ports.sort_unstable();
        let report = ScanReport {
            open_ports,
            canceled: cancel.is_cancelled(),
            scanned: counters.snapshot().scanned,
        };
        debug!(
            %ip,
            open = report.open_ports.len(),
            scanned = report.scanned,
            canceled = report.canceled,
            "port scan finished"
        );
        report
    }
}
