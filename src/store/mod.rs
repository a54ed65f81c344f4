//! Persistence operations consumed by the scheduler, dispatcher and reconciler.

mod schema;
mod sqlite;

use std::collections::BTreeSet;

use async_trait::async_trait;

pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::types::{ScanId, ScanJob, ScheduleCandidate, Server, ServerId, Settings};

#[async_trait]
pub trait ScanStore: Send + Sync {
    /// Current settings; inserts the default row on first read.
    async fn get_settings(&self) -> Result<Settings>;

    /// Jobs in `queued` or `scanning`, oldest first.
    async fn list_pending_jobs(&self) -> Result<Vec<ScanJob>>;

    async fn get_server(&self, id: ServerId) -> Result<Server>;

    /// Claim a job for scanning. Returns `false` if the job is no longer pending.
    async fn mark_scan_started(&self, scan_id: ScanId) -> Result<bool>;

    async fn update_scan_progress(&self, scan_id: ScanId, scanned: u64, open: u64) -> Result<()>;

    async fn is_scan_canceled(&self, scan_id: ScanId) -> Result<bool>;

    /// Record completion. Returns `false` if the job had already left `scanning`
    /// (a late cancel wins).
    async fn mark_scan_done(&self, scan_id: ScanId, total: u64, open: u64) -> Result<bool>;

    async fn mark_scan_error(&self, scan_id: ScanId, message: &str) -> Result<()>;

    async fn mark_scan_canceled(&self, scan_id: ScanId) -> Result<()>;

    /// Every schedulable server with the epoch of its most recent `done` scan.
    async fn list_servers_with_last_completed_scan(&self) -> Result<Vec<ScheduleCandidate>>;

    async fn has_active_scan(&self, server_id: ServerId) -> Result<bool>;

    async fn enqueue_scan(&self, server_id: ServerId, total_ports: u16) -> Result<ScanId>;

    async fn list_existing_open_ports(&self, server_id: ServerId) -> Result<BTreeSet<u16>>;

    /// Insert `ports` in one transaction, skipping any the server already has.
    /// Returns how many rows were added.
    async fn insert_new_ports(&self, server_id: ServerId, ports: &[u16]) -> Result<usize>;
}
