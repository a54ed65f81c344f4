use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub type ServerId = i64;
pub type ScanId = i64;

/// Highest TCP port; also the default size of a full-range scan.
pub const MAX_PORT: u16 = 65535;

/// A scan target. Owned by whoever registers servers; the agent only reads it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub id: ServerId,
    pub name: String,
    pub ip: String,
    pub exclude_from_scan: bool,
}

/// Singleton scheduling settings, re-read on every tick.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub scan_enabled: bool,
    pub scan_interval_minutes: u32,
    pub scan_concurrency: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scan_enabled: true,
            scan_interval_minutes: 1440,
            scan_concurrency: 2,
        }
    }
}

/// Lifecycle of a scan job: `queued -> scanning -> {done | error | canceled}`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Queued,
    Scanning,
    Done,
    Error,
    Canceled,
}

impl ScanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanStatus::Queued => "queued",
            ScanStatus::Scanning => "scanning",
            ScanStatus::Done => "done",
            ScanStatus::Error => "error",
            ScanStatus::Canceled => "canceled",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, ScanStatus::Queued | ScanStatus::Scanning)
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown scan status: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for ScanStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(ScanStatus::Queued),
            "scanning" => Ok(ScanStatus::Scanning),
            "done" => Ok(ScanStatus::Done),
            "error" => Ok(ScanStatus::Error),
            "canceled" => Ok(ScanStatus::Canceled),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Persisted scan job record. Timestamps are SQLite `CURRENT_TIMESTAMP` strings (UTC).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanJob {
    pub scan_id: ScanId,
    pub server_id: ServerId,
    /// As stored; zero or negative means "all ports".
    pub total_ports: i64,
    pub status: ScanStatus,
    pub scanned_ports: i64,
    pub open_ports: i64,
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub updated_at: String,
}

impl ScanJob {
    /// Port count the engine should cover. Non-positive or out-of-range values mean a full scan.
    pub fn effective_total_ports(&self) -> u16 {
        normalize_total_ports(self.total_ports)
    }
}

pub fn normalize_total_ports(total: i64) -> u16 {
    if total <= 0 || total > i64::from(MAX_PORT) {
        MAX_PORT
    } else {
        total as u16
    }
}

/// One row of the eligibility query: a server and the epoch of its latest `done` scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleCandidate {
    pub server_id: ServerId,
    pub last_done_epoch: Option<i64>,
}

/// Point-in-time progress counters for a running scan.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanProgress {
    pub total: u64,
    pub scanned: u64,
    pub open: u64,
}

/// Engine output: open ports in ascending order and whether cancellation was ever raised.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub open_ports: Vec<u16>,
    pub canceled: bool,
    pub scanned: u64,
}

/// Port import document: either a bare array of servers or `{"servers": [...]}`.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ImportDocument {
    Servers(Vec<ImportServer>),
    Wrapped { servers: Vec<ImportServer> },
}

impl ImportDocument {
    pub fn into_servers(self) -> Vec<ImportServer> {
        match self {
            ImportDocument::Servers(servers) | ImportDocument::Wrapped { servers } => servers,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ImportServer {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default, alias = "excludeFromScan")]
    pub exclude_from_scan: bool,
    #[serde(default)]
    pub ports: Vec<ImportPort>,
}

/// A port given as a bare number or as `{"port": n, ...}`.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(untagged)]
pub enum ImportPort {
    Number(i64),
    Entry { port: i64 },
}

impl ImportPort {
    pub fn number(&self) -> i64 {
        match *self {
            ImportPort::Number(port) | ImportPort::Entry { port } => port,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub servers_created: usize,
    pub ports_created: usize,
    pub ports_skipped: usize,
}
