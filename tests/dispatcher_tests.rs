mod common;

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{test_config, FakeHost};
use portwatch::agent::Agent;
use portwatch::dial::Connector;
use portwatch::dispatcher::{Dispatcher, JobOutcome};
use portwatch::error::{Result, StoreError};
use portwatch::scanner::PortScanner;
use portwatch::store::{ScanStore, SqliteStore};
use portwatch::types::{
    ScanId, ScanJob, ScanStatus, ScheduleCandidate, Server, ServerId, Settings, MAX_PORT,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn dispatcher<C: Connector + 'static>(store: &Arc<SqliteStore>, connector: C, workers: usize) -> Dispatcher<C> {
    let store: Arc<dyn ScanStore> = store.clone();
    Dispatcher::new(store, PortScanner::with_connector(test_config(workers), connector))
}

#[tokio::test]
async fn completed_job_records_ports_and_totals() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let server = store.add_server("web", "10.0.0.5", false).await.unwrap();
    store.insert_new_ports(server, &[22]).await.unwrap();
    let scan = store.enqueue_scan(server, 100).await.unwrap();

    let outcomes = dispatcher(&store, FakeHost::with_open(&[80, 22]), 8)
        .dispatch(&Settings::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        outcomes,
        vec![(
            scan,
            JobOutcome::Done {
                open_ports: 2,
                new_ports: 1
            }
        )]
    );

    let job = store.get_scan(scan).await.unwrap().unwrap();
    assert_eq!(job.status, ScanStatus::Done);
    assert_eq!(job.scanned_ports, 100);
    assert_eq!(job.open_ports, 2);
    assert_eq!(store.list_ports(server).await.unwrap(), vec![22, 80]);
}

#[tokio::test]
async fn non_positive_total_scans_full_range() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let server = store.add_server("web", "10.0.0.5", false).await.unwrap();
    let scan = store.enqueue_scan(server, 0).await.unwrap();

    dispatcher(&store, FakeHost::with_open(&[65535]), 64)
        .dispatch(&Settings::default(), &CancellationToken::new())
        .await
        .unwrap();

    let job = store.get_scan(scan).await.unwrap().unwrap();
    assert_eq!(job.status, ScanStatus::Done);
    assert_eq!(job.scanned_ports, i64::from(MAX_PORT));
    assert_eq!(store.list_ports(server).await.unwrap(), vec![65535]);
}

#[tokio::test]
async fn unknown_server_leaves_job_queued() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let scan = store.enqueue_scan(999, 10).await.unwrap();

    let outcomes = dispatcher(&store, FakeHost::with_open(&[]), 2)
        .dispatch(&Settings::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcomes, vec![(scan, JobOutcome::Skipped)]);
    assert_eq!(
        store.get_scan(scan).await.unwrap().unwrap().status,
        ScanStatus::Queued
    );
}

#[tokio::test]
async fn reconcile_failure_marks_job_error_without_touching_siblings() {
    let inner = Arc::new(SqliteStore::in_memory().unwrap());
    let broken = inner.add_server("broken", "10.0.0.1", false).await.unwrap();
    let healthy = inner.add_server("healthy", "10.0.0.2", false).await.unwrap();
    let broken_scan = inner.enqueue_scan(broken, 50).await.unwrap();
    let healthy_scan = inner.enqueue_scan(healthy, 50).await.unwrap();

    let store: Arc<dyn ScanStore> = Arc::new(InterceptInserts {
        inner: Arc::clone(&inner),
        server: broken,
        action: InsertAction::Reject,
    });
    let outcomes = Dispatcher::new(
        store,
        PortScanner::with_connector(test_config(4), FakeHost::with_open(&[25])),
    )
    .dispatch(&Settings::default(), &CancellationToken::new())
    .await
    .unwrap();
    assert_eq!(outcomes.len(), 2);

    let failed = inner.get_scan(broken_scan).await.unwrap().unwrap();
    assert_eq!(failed.status, ScanStatus::Error);
    assert!(failed.error.unwrap().contains("not found"));
    assert!(inner.list_ports(broken).await.unwrap().is_empty());

    let ok = inner.get_scan(healthy_scan).await.unwrap().unwrap();
    assert_eq!(ok.status, ScanStatus::Done);
    assert_eq!(inner.list_ports(healthy).await.unwrap(), vec![25]);
}

#[tokio::test]
async fn cancel_landing_after_scan_wins_over_completion() {
    let inner = Arc::new(SqliteStore::in_memory().unwrap());
    let server = inner.add_server("web", "10.0.0.3", false).await.unwrap();
    let scan = inner.enqueue_scan(server, 40).await.unwrap();

    let store: Arc<dyn ScanStore> = Arc::new(InterceptInserts {
        inner: Arc::clone(&inner),
        server,
        action: InsertAction::CancelJob(scan),
    });
    let outcomes = Dispatcher::new(
        store,
        PortScanner::with_connector(test_config(4), FakeHost::with_open(&[8])),
    )
    .dispatch(&Settings::default(), &CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(outcomes, vec![(scan, JobOutcome::Canceled)]);
    let job = inner.get_scan(scan).await.unwrap().unwrap();
    assert_eq!(job.status, ScanStatus::Canceled);
}

#[tokio::test]
async fn external_cancel_stops_running_job() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let server = store.add_server("slow", "10.0.0.9", false).await.unwrap();
    let scan = store.enqueue_scan(server, MAX_PORT).await.unwrap();

    let host = FakeHost::with_open(&[]).latency(Duration::from_millis(2));
    let d = dispatcher(&store, host, 4);
    let run = tokio::spawn(async move {
        d.dispatch(&Settings::default(), &CancellationToken::new())
            .await
            .unwrap()
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.cancel_scan(scan).await.unwrap());

    let outcomes = run.await.unwrap();
    assert_eq!(outcomes, vec![(scan, JobOutcome::Canceled)]);

    let job = store.get_scan(scan).await.unwrap().unwrap();
    assert_eq!(job.status, ScanStatus::Canceled);
    assert!(job.scanned_ports > 0, "progress was persisted while running");
    assert!(job.scanned_ports < i64::from(MAX_PORT));
    assert!(job.finished_at.is_some());
}

#[tokio::test]
async fn shutdown_leaves_job_resumable() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let server = store.add_server("slow", "10.0.0.9", false).await.unwrap();
    let scan = store.enqueue_scan(server, MAX_PORT).await.unwrap();

    let host = FakeHost::with_open(&[]).latency(Duration::from_millis(2));
    let d = dispatcher(&store, host, 4);
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let run = tokio::spawn(async move { d.dispatch(&Settings::default(), &token).await.unwrap() });

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.cancel();

    let outcomes = run.await.unwrap();
    assert_eq!(outcomes, vec![(scan, JobOutcome::Interrupted)]);
    assert_eq!(
        store.get_scan(scan).await.unwrap().unwrap().status,
        ScanStatus::Scanning
    );
    assert_eq!(store.list_pending_jobs().await.unwrap().len(), 1);
}

#[tokio::test]
async fn concurrency_gate_bounds_parallel_jobs() {
    for limit in [1usize, 2] {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        for i in 1..=4 {
            let server = store
                .add_server(&format!("s{i}"), &format!("10.0.1.{i}"), false)
                .await
                .unwrap();
            store.enqueue_scan(server, 20).await.unwrap();
        }

        let recorder = Arc::new(Recorder::default());
        let settings = Settings {
            scan_concurrency: limit as u32,
            ..Settings::default()
        };
        let outcomes = dispatcher(&store, SharedRecorder(Arc::clone(&recorder)), 1)
            .dispatch(&settings, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 4);
        assert!(outcomes
            .iter()
            .all(|(_, o)| matches!(o, JobOutcome::Done { .. })));

        assert!(
            recorder.max_overlap() <= limit,
            "limit {limit} exceeded: {}",
            recorder.max_overlap()
        );
    }
}

#[tokio::test]
async fn agent_tick_schedules_and_runs_due_servers() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let server = store.add_server("fresh", "10.0.0.20", false).await.unwrap();

    let dyn_store: Arc<dyn ScanStore> = store.clone();
    let agent = Agent::new(
        dyn_store,
        PortScanner::with_connector(test_config(256), FakeHost::with_open(&[443])),
        Duration::from_secs(10),
    );

    let outcomes = agent.tick(&CancellationToken::new()).await;
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0].1, JobOutcome::Done { open_ports: 1, .. }));
    assert_eq!(store.list_ports(server).await.unwrap(), vec![443]);

    // the fresh completion makes the server not due on the next tick
    assert!(agent.tick(&CancellationToken::new()).await.is_empty());
}

/// Records the first and last dial time per host so overlapping scans can be counted.
#[derive(Default)]
struct Recorder {
    spans: Mutex<HashMap<IpAddr, (Instant, Instant)>>,
}

impl Recorder {
    fn max_overlap(&self) -> usize {
        let spans = self.spans.lock().unwrap();
        let mut events: Vec<(Instant, i32)> = Vec::new();
        for (start, end) in spans.values() {
            events.push((*start, 1));
            events.push((*end, -1));
        }
        events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        let (mut current, mut max) = (0i32, 0i32);
        for (_, delta) in events {
            current += delta;
            max = max.max(current);
        }
        max as usize
    }
}

struct SharedRecorder(Arc<Recorder>);

#[async_trait]
impl Connector for SharedRecorder {
    async fn connect(&self, addr: SocketAddr, _timeout: Duration) -> std::io::Result<()> {
        let now = Instant::now();
        {
            let mut spans = self.0.spans.lock().unwrap();
            let span = spans.entry(addr.ip()).or_insert((now, now));
            span.1 = now;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "Connection refused",
        ))
    }
}

enum InsertAction {
    /// Fail the insert.
    Reject,
    /// Cancel the given job, then insert normally.
    CancelJob(ScanId),
}

/// Delegates to SQLite but intercepts port inserts for one server.
struct InterceptInserts {
    inner: Arc<SqliteStore>,
    server: ServerId,
    action: InsertAction,
}

#[async_trait]
impl ScanStore for InterceptInserts {
    async fn get_settings(&self) -> Result<Settings> {
        self.inner.get_settings().await
    }
    async fn list_pending_jobs(&self) -> Result<Vec<ScanJob>> {
        self.inner.list_pending_jobs().await
    }
    async fn get_server(&self, id: ServerId) -> Result<Server> {
        self.inner.get_server(id).await
    }
    async fn mark_scan_started(&self, scan_id: ScanId) -> Result<bool> {
        self.inner.mark_scan_started(scan_id).await
    }
    async fn update_scan_progress(&self, scan_id: ScanId, scanned: u64, open: u64) -> Result<()> {
        self.inner.update_scan_progress(scan_id, scanned, open).await
    }
    async fn is_scan_canceled(&self, scan_id: ScanId) -> Result<bool> {
        self.inner.is_scan_canceled(scan_id).await
    }
    async fn mark_scan_done(&self, scan_id: ScanId, total: u64, open: u64) -> Result<bool> {
        self.inner.mark_scan_done(scan_id, total, open).await
    }
    async fn mark_scan_error(&self, scan_id: ScanId, message: &str) -> Result<()> {
        self.inner.mark_scan_error(scan_id, message).await
    }
    async fn mark_scan_canceled(&self, scan_id: ScanId) -> Result<()> {
        self.inner.mark_scan_canceled(scan_id).await
    }
    async fn list_servers_with_last_completed_scan(&self) -> Result<Vec<ScheduleCandidate>> {
        self.inner.list_servers_with_last_completed_scan().await
    }
    async fn has_active_scan(&self, server_id: ServerId) -> Result<bool> {
        self.inner.has_active_scan(server_id).await
    }
    async fn enqueue_scan(&self, server_id: ServerId, total_ports: u16) -> Result<ScanId> {
        self.inner.enqueue_scan(server_id, total_ports).await
    }
    async fn list_existing_open_ports(&self, server_id: ServerId) -> Result<BTreeSet<u16>> {
        self.inner.list_existing_open_ports(server_id).await
    }
    async fn insert_new_ports(&self, server_id: ServerId, ports: &[u16]) -> Result<usize> {
        if server_id == self.server {
            match self.action {
                InsertAction::Reject => {
                    return Err(StoreError::NotFound {
                        entity: "port table",
                        id: server_id,
                    })
                }
                InsertAction::CancelJob(scan_id) => {
                    self.inner.cancel_scan(scan_id).await?;
                }
            }
        }
        self.inner.insert_new_ports(server_id, ports).await
    }
}
