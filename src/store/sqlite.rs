//! SQLite-backed [`ScanStore`].
//!
//! A single connection sits behind a mutex so all writes are serialized; each call runs on
//! the blocking pool so the async scheduler and scan workers never stall on disk I/O.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::task;
use tracing::{debug, info};

use super::{schema, ScanStore};
use crate::error::{Result, StoreError};
use crate::types::{
    ImportServer, ImportSummary, ScanId, ScanJob, ScanStatus, ScheduleCandidate, Server,
    ServerId, Settings, MAX_PORT,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const JOB_COLUMNS: &str = "id, server_id, total_ports, status, scanned_ports, open_ports, \
                           error, created_at, started_at, finished_at, updated_at";

#[derive(Clone, Debug)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database named by `url`. Accepts plain paths, `file:` URIs and
    /// `sqlite://` prefixed paths.
    pub fn open(url: &str) -> Result<Self> {
        let path = url.strip_prefix("sqlite://").unwrap_or(url);
        let conn = Connection::open(path)?;
        Self::initialize(conn)
    }

    /// Fresh in-memory database (tests, dry runs).
    pub fn in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        schema::create_tables(&conn)?;
        debug!(journal_mode = %mode, "database initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Raw connection handle for ad-hoc queries.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut *guard)
        })
        .await?
    }

    pub async fn add_server(&self, name: &str, ip: &str, exclude_from_scan: bool) -> Result<ServerId> {
        let (name, ip) = (name.to_string(), ip.to_string());
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO servers (name, ip, exclude_from_scan) VALUES (?1, ?2, ?3)",
                params![name, ip, exclude_from_scan],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Manual scan request. Returns the already-active job for the server if there is one,
    /// otherwise enqueues a full-range job. The flag is `true` when a job was created.
    pub async fn request_scan(&self, server_id: ServerId) -> Result<(ScanId, bool)> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM servers WHERE id = ?1)",
                params![server_id],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(StoreError::NotFound {
                    entity: "server",
                    id: server_id,
                });
            }

            let active: Option<ScanId> = tx
                .query_row(
                    "SELECT id FROM scans WHERE server_id = ?1 AND status IN ('queued', 'scanning')
                     ORDER BY created_at DESC, id DESC LIMIT 1",
                    params![server_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(scan_id) = active {
                return Ok((scan_id, false));
            }

            tx.execute(
                "INSERT INTO scans (server_id, status, total_ports) VALUES (?1, 'queued', ?2)",
                params![server_id, MAX_PORT],
            )?;
            let scan_id = tx.last_insert_rowid();
            tx.commit()?;
            Ok((scan_id, true))
        })
        .await
    }

    /// Request cancellation of a pending job. Returns `false` if it was not pending.
    pub async fn cancel_scan(&self, scan_id: ScanId) -> Result<bool> {
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE scans SET status = 'canceled', finished_at = CURRENT_TIMESTAMP,
                     updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?1 AND status IN ('queued', 'scanning')",
                params![scan_id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn get_scan(&self, scan_id: ScanId) -> Result<Option<ScanJob>> {
        self.call(move |conn| {
            let job = conn
                .query_row(
                    &format!("SELECT {JOB_COLUMNS} FROM scans WHERE id = ?1"),
                    params![scan_id],
                    job_from_row,
                )
                .optional()?;
            Ok(job)
        })
        .await
    }

    /// Recorded open ports for a server, ascending.
    pub async fn list_ports(&self, server_id: ServerId) -> Result<Vec<u16>> {
        Ok(self
            .list_existing_open_ports(server_id)
            .await?
            .into_iter()
            .collect())
    }

    pub async fn update_settings(&self, settings: Settings) -> Result<()> {
        self.get_settings().await?;
        self.call(move |conn| {
            conn.execute(
                "UPDATE settings SET scan_enabled = ?1, scan_interval_minutes = ?2, scan_concurrency = ?3
                 WHERE id = (SELECT id FROM settings ORDER BY id ASC LIMIT 1)",
                params![
                    settings.scan_enabled,
                    settings.scan_interval_minutes.max(1),
                    settings.scan_concurrency.max(1)
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Queue a full-range scan for every non-excluded server that has no active job.
    /// Returns how many jobs were created.
    pub async fn queue_all(&self) -> Result<usize> {
        self.call(|conn| {
            let tx = conn.transaction()?;
            let servers = {
                let mut stmt =
                    tx.prepare("SELECT id FROM servers WHERE exclude_from_scan = 0 ORDER BY id")?;
                let ids = stmt
                    .query_map([], |row| row.get::<_, ServerId>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                ids
            };

            let mut queued: usize = 0;
            for server_id in servers {
                if server_has_active_scan(&tx, server_id)? {
                    continue;
                }
                tx.execute(
                    "INSERT INTO scans (server_id, status, total_ports) VALUES (?1, 'queued', ?2)",
                    params![server_id, MAX_PORT],
                )?;
                queued += 1;
            }
            tx.commit()?;
            info!(queued, "queued scans for all servers");
            Ok(queued)
        })
        .await
    }

    /// Create the servers of an import document together with their ports, all in one
    /// transaction. Ports outside `0..=65535` and ports repeated for the same server are
    /// counted as skipped.
    pub async fn import_servers(&self, servers: Vec<ImportServer>) -> Result<ImportSummary> {
        if let Some(index) = servers
            .iter()
            .position(|s| s.name.trim().is_empty() || s.ip.trim().is_empty())
        {
            return Err(StoreError::InvalidImport(format!(
                "server #{index} must include a name and an IP"
            )));
        }

        self.call(move |conn| {
            let tx = conn.transaction()?;
            let mut summary = ImportSummary::default();
            for server in &servers {
                tx.execute(
                    "INSERT INTO servers (name, ip, exclude_from_scan) VALUES (?1, ?2, ?3)",
                    params![server.name.trim(), server.ip.trim(), server.exclude_from_scan],
                )?;
                let server_id = tx.last_insert_rowid();
                summary.servers_created += 1;

                let mut valid = Vec::with_capacity(server.ports.len());
                for entry in &server.ports {
                    match u16::try_from(entry.number()) {
                        Ok(port) => valid.push(port),
                        Err(_) => summary.ports_skipped += 1,
                    }
                }
                let added = insert_ports(&tx, server_id, &valid)?;
                summary.ports_created += added;
                summary.ports_skipped += valid.len() - added;
            }
            tx.commit()?;
            info!(
                servers = summary.servers_created,
                ports = summary.ports_created,
                skipped = summary.ports_skipped,
                "import finished"
            );
            Ok(summary)
        })
        .await
    }
}

fn server_has_active_scan(conn: &Connection, server_id: ServerId) -> Result<bool> {
    let active = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM scans WHERE server_id = ?1
             AND status IN ('queued', 'scanning'))",
        params![server_id],
        |row| row.get(0),
    )?;
    Ok(active)
}

/// `INSERT OR IGNORE` so a port already recorded (by an earlier row in the batch or by a
/// concurrent scan of the same server) is skipped. Returns rows actually inserted.
fn insert_ports(conn: &Connection, server_id: ServerId, ports: &[u16]) -> Result<usize> {
    let mut stmt = conn.prepare("INSERT OR IGNORE INTO ports (server_id, port) VALUES (?1, ?2)")?;
    let mut added = 0;
    for port in ports {
        added += stmt.execute(params![server_id, port])?;
    }
    Ok(added)
}

fn clamp_positive(value: i64) -> u32 {
    u32::try_from(value.max(1)).unwrap_or(u32::MAX)
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<ScanJob> {
    let status: String = row.get(3)?;
    let status = status
        .parse::<ScanStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    Ok(ScanJob {
        scan_id: row.get(0)?,
        server_id: row.get(1)?,
        total_ports: row.get(2)?,
        status,
        scanned_ports: row.get(4)?,
        open_ports: row.get(5)?,
        error: row.get(6)?,
        created_at: row.get(7)?,
        started_at: row.get(8)?,
        finished_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

#[async_trait]
impl ScanStore for SqliteStore {
    async fn get_settings(&self) -> Result<Settings> {
        self.call(|conn| {
            let row = conn
                .query_row(
                    "SELECT scan_enabled, scan_interval_minutes, scan_concurrency
                     FROM settings ORDER BY id ASC LIMIT 1",
                    [],
                    |row| {
                        Ok((
                            row.get::<_, bool>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    },
                )
                .optional()?;

            match row {
                Some((enabled, interval, concurrency)) => Ok(Settings {
                    scan_enabled: enabled,
                    scan_interval_minutes: clamp_positive(interval),
                    scan_concurrency: clamp_positive(concurrency),
                }),
                None => {
                    let defaults = Settings::default();
                    conn.execute(
                        "INSERT INTO settings (scan_enabled, scan_interval_minutes, scan_concurrency)
                         VALUES (?1, ?2, ?3)",
                        params![
                            defaults.scan_enabled,
                            defaults.scan_interval_minutes,
                            defaults.scan_concurrency
                        ],
                    )?;
                    info!("created default settings row");
                    Ok(defaults)
                }
            }
        })
        .await
    }

    async fn list_pending_jobs(&self) -> Result<Vec<ScanJob>> {
        self.call(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM scans WHERE status IN ('queued', 'scanning')
                 ORDER BY created_at ASC, id ASC"
            ))?;
            let jobs = stmt
                .query_map([], job_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(jobs)
        })
        .await
    }

    async fn get_server(&self, id: ServerId) -> Result<Server> {
        self.call(move |conn| {
            conn.query_row(
                "SELECT id, name, ip, exclude_from_scan FROM servers WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Server {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        ip: row.get(2)?,
                        exclude_from_scan: row.get(3)?,
                    })
                },
            )
            .optional()?
            .ok_or(StoreError::NotFound { entity: "server", id })
        })
        .await
    }

    async fn mark_scan_started(&self, scan_id: ScanId) -> Result<bool> {
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE scans SET status = 'scanning',
                     started_at = COALESCE(started_at, CURRENT_TIMESTAMP),
                     updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?1 AND status IN ('queued', 'scanning')",
                params![scan_id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn update_scan_progress(&self, scan_id: ScanId, scanned: u64, open: u64) -> Result<()> {
        let (scanned, open) = (scanned as i64, open as i64);
        self.call(move |conn| {
            conn.execute(
                "UPDATE scans SET scanned_ports = MAX(scanned_ports, ?1),
                     open_ports = MAX(open_ports, ?2),
                     updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?3",
                params![scanned, open, scan_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn is_scan_canceled(&self, scan_id: ScanId) -> Result<bool> {
        self.call(move |conn| {
            let status: Option<String> = conn
                .query_row(
                    "SELECT status FROM scans WHERE id = ?1",
                    params![scan_id],
                    |row| row.get(0),
                )
                .optional()?;
            match status {
                Some(status) => Ok(status == ScanStatus::Canceled.as_str()),
                None => Err(StoreError::NotFound {
                    entity: "scan",
                    id: scan_id,
                }),
            }
        })
        .await
    }

    async fn mark_scan_done(&self, scan_id: ScanId, total: u64, open: u64) -> Result<bool> {
        let (total, open) = (total as i64, open as i64);
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE scans SET status = 'done', scanned_ports = ?1, open_ports = ?2,
                     finished_at = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?3 AND status = 'scanning'",
                params![total, open, scan_id],
            )?;
            if changed == 0 {
                debug!(scan_id, "scan left scanning state before completion was recorded");
            }
            Ok(changed > 0)
        })
        .await
    }

    async fn mark_scan_error(&self, scan_id: ScanId, message: &str) -> Result<()> {
        let message = message.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE scans SET status = 'error', error = ?1,
                     finished_at = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?2 AND status IN ('queued', 'scanning')",
                params![message, scan_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn mark_scan_canceled(&self, scan_id: ScanId) -> Result<()> {
        self.call(move |conn| {
            conn.execute(
                "UPDATE scans SET status = 'canceled',
                     finished_at = COALESCE(finished_at, CURRENT_TIMESTAMP),
                     updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?1 AND status IN ('queued', 'scanning', 'canceled')",
                params![scan_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_servers_with_last_completed_scan(&self) -> Result<Vec<ScheduleCandidate>> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT s.id, MAX(CAST(strftime('%s', sc.finished_at) AS INTEGER))
                 FROM servers s
                 LEFT JOIN scans sc ON sc.server_id = s.id AND sc.status = 'done'
                 WHERE s.exclude_from_scan = 0
                 GROUP BY s.id
                 ORDER BY s.id",
            )?;
            let candidates = stmt
                .query_map([], |row| {
                    Ok(ScheduleCandidate {
                        server_id: row.get(0)?,
                        last_done_epoch: row.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(candidates)
        })
        .await
    }

    async fn has_active_scan(&self, server_id: ServerId) -> Result<bool> {
        self.call(move |conn| server_has_active_scan(conn, server_id)).await
    }

    async fn enqueue_scan(&self, server_id: ServerId, total_ports: u16) -> Result<ScanId> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO scans (server_id, status, total_ports, scanned_ports, open_ports)
                 VALUES (?1, 'queued', ?2, 0, 0)",
                params![server_id, total_ports],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn list_existing_open_ports(&self, server_id: ServerId) -> Result<BTreeSet<u16>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare("SELECT port FROM ports WHERE server_id = ?1")?;
            let ports = stmt
                .query_map(params![server_id], |row| row.get::<_, u16>(0))?
                .collect::<rusqlite::Result<BTreeSet<_>>>()?;
            Ok(ports)
        })
        .await
    }

    async fn insert_new_ports(&self, server_id: ServerId, ports: &[u16]) -> Result<usize> {
        let ports = ports.to_vec();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let added = insert_ports(&tx, server_id, &ports)?;
            tx.commit()?;
            Ok(added)
        })
        .await
    }
}
