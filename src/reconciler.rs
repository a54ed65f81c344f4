use std::collections::BTreeSet;

use tracing::debug;

use crate::error::Result;
use crate::store::ScanStore;
use crate::types::ServerId;

/// Record ports discovered by a scan that the server does not already have.
///
/// Known ports are never removed or re-inserted, so repeating a discovery set (or any
/// subset of it) is a no-op. New ports are written in a single batch; a port committed by
/// a concurrent scan of the same server after the read is skipped rather than failing the
/// batch. Returns how many ports were added.
pub async fn reconcile(store: &dyn ScanStore, server_id: ServerId, discovered: &[u16]) -> Result<usize> {
    let known = store.list_existing_open_ports(server_id).await?;
    let fresh: Vec<u16> = discovered
        .iter()
        .copied()
        .filter(|port| !known.contains(port))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    if fresh.is_empty() {
        return Ok(0);
    }

    let added = store.insert_new_ports(server_id, &fresh).await?;
    debug!(server_id, added, "recorded new open ports");
    Ok(added)
}
