use rusqlite::Connection;

use crate::error::Result;

pub(super) fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            scan_enabled INTEGER NOT NULL DEFAULT 1,
            scan_interval_minutes INTEGER NOT NULL DEFAULT 1440,
            scan_concurrency INTEGER NOT NULL DEFAULT 2
        );

        CREATE TABLE IF NOT EXISTS servers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            ip TEXT NOT NULL,
            exclude_from_scan INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS scans (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            server_id INTEGER NOT NULL REFERENCES servers(id),
            status TEXT NOT NULL DEFAULT 'queued',
            total_ports INTEGER NOT NULL DEFAULT 65535,
            scanned_ports INTEGER NOT NULL DEFAULT 0,
            open_ports INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            started_at TEXT,
            finished_at TEXT,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX IF NOT EXISTS idx_scans_status ON scans(status, created_at);
        CREATE INDEX IF NOT EXISTS idx_scans_server ON scans(server_id, status);

        CREATE TABLE IF NOT EXISTS ports (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            server_id INTEGER NOT NULL REFERENCES servers(id),
            port INTEGER NOT NULL,
            note TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(server_id, port)
        );
        "#,
    )?;
    Ok(())
}
