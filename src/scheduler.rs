use tracing::{debug, info};

use crate::error::Result;
use crate::store::ScanStore;
use crate::types::{ScanId, ScheduleCandidate, Settings, MAX_PORT};

/// Enqueue a full-range scan for every server whose last completed scan is older than
/// the configured interval (or that has never completed one).
///
/// Servers that already have a queued or scanning job are skipped even when overdue. The
/// active-job check and the insert are separate statements, so two concurrent callers can
/// still both enqueue; the duplicate scan is wasted work, not a correctness problem.
///
/// `now_epoch` is the current Unix time in seconds. Returns the ids of the jobs created.
pub async fn enqueue_due(store: &dyn ScanStore, settings: &Settings, now_epoch: i64) -> Result<Vec<ScanId>> {
    if !settings.scan_enabled {
        debug!("periodic scanning disabled");
        return Ok(Vec::new());
    }

    let interval_secs = i64::from(settings.scan_interval_minutes.max(1)) * 60;
    let candidates = store.list_servers_with_last_completed_scan().await?;

    let mut created = Vec::new();
    for candidate in candidates {
        if !is_due(&candidate, now_epoch, interval_secs) {
            continue;
        }
        if store.has_active_scan(candidate.server_id).await? {
            debug!(server_id = candidate.server_id, "overdue but already has an active scan");
            continue;
        }

        let scan_id = store.enqueue_scan(candidate.server_id, MAX_PORT).await?;
        info!(server_id = candidate.server_id, scan_id, "enqueued periodic scan");
        created.push(scan_id);
    }

    Ok(created)
}

fn is_due(candidate: &ScheduleCandidate, now_epoch: i64, interval_secs: i64) -> bool {
    match candidate.last_done_epoch {
        None => true,
        Some(last) => now_epoch - last >= interval_secs,
    }
}
