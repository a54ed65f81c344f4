use portwatch::scheduler::enqueue_due;
use portwatch::store::{ScanStore, SqliteStore};
use portwatch::types::{ScanStatus, ServerId, Settings, MAX_PORT};
use time::OffsetDateTime;

fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

async fn complete_scan(store: &SqliteStore, server: ServerId) {
    let scan = store.enqueue_scan(server, MAX_PORT).await.unwrap();
    store.mark_scan_started(scan).await.unwrap();
    store.mark_scan_done(scan, u64::from(MAX_PORT), 0).await.unwrap();
}

#[tokio::test]
async fn disabled_scheduling_is_a_no_op() {
    let store = SqliteStore::in_memory().unwrap();
    store.add_server("a", "10.0.0.1", false).await.unwrap();
    let settings = Settings {
        scan_enabled: false,
        ..Settings::default()
    };

    assert!(enqueue_due(&store, &settings, now()).await.unwrap().is_empty());
    assert!(store.list_pending_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn never_scanned_servers_are_enqueued_with_full_range() {
    let store = SqliteStore::in_memory().unwrap();
    let a = store.add_server("a", "10.0.0.1", false).await.unwrap();
    let b = store.add_server("b", "10.0.0.2", false).await.unwrap();

    let created = enqueue_due(&store, &Settings::default(), now()).await.unwrap();
    assert_eq!(created.len(), 2);

    let jobs = store.list_pending_jobs().await.unwrap();
    let servers: Vec<_> = jobs.iter().map(|j| j.server_id).collect();
    assert_eq!(servers, vec![a, b]);
    assert!(jobs
        .iter()
        .all(|j| j.status == ScanStatus::Queued && j.total_ports == i64::from(MAX_PORT)));
}

#[tokio::test]
async fn overdue_server_gets_exactly_one_job() {
    let store = SqliteStore::in_memory().unwrap();
    let server = store.add_server("a", "10.0.0.1", false).await.unwrap();
    complete_scan(&store, server).await;

    // last completed scan is 2000 minutes old against a 1440 minute interval
    let later = now() + 2000 * 60;
    let created = enqueue_due(&store, &Settings::default(), later).await.unwrap();
    assert_eq!(created.len(), 1);

    let jobs = store.list_pending_jobs().await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].server_id, server);
    assert_eq!(jobs[0].status, ScanStatus::Queued);
    assert_eq!(jobs[0].total_ports, i64::from(MAX_PORT));
}

#[tokio::test]
async fn recently_scanned_server_is_not_due() {
    let store = SqliteStore::in_memory().unwrap();
    let server = store.add_server("a", "10.0.0.1", false).await.unwrap();
    complete_scan(&store, server).await;

    let later = now() + 1000 * 60;
    assert!(enqueue_due(&store, &Settings::default(), later).await.unwrap().is_empty());
}

#[tokio::test]
async fn active_job_prevents_duplicate_enqueue() {
    let store = SqliteStore::in_memory().unwrap();
    let server = store.add_server("a", "10.0.0.1", false).await.unwrap();
    let scan = store.enqueue_scan(server, MAX_PORT).await.unwrap();

    assert!(enqueue_due(&store, &Settings::default(), now()).await.unwrap().is_empty());

    store.mark_scan_started(scan).await.unwrap();
    let far_future = now() + 10 * 365 * 24 * 3600;
    assert!(enqueue_due(&store, &Settings::default(), far_future)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(store.list_pending_jobs().await.unwrap().len(), 1);
}

#[tokio::test]
async fn repeated_ticks_do_not_pile_up_jobs() {
    let store = SqliteStore::in_memory().unwrap();
    store.add_server("a", "10.0.0.1", false).await.unwrap();

    for _ in 0..3 {
        enqueue_due(&store, &Settings::default(), now()).await.unwrap();
    }
    assert_eq!(store.list_pending_jobs().await.unwrap().len(), 1);
}
