use std::time::Duration;

use crate::dial::DialPolicy;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_millis(1500);
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(25);
pub const DEFAULT_MAX_RETRIES: u32 = 1;
pub const DEFAULT_WORKERS: usize = 500;
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Port queue slots per worker. The feeder blocks once `workers * slots` ports are waiting.
pub const DEFAULT_QUEUE_SLOTS_PER_WORKER: usize = 4;

/// Tunables for the scan engine and its dial attempts.
///
/// Built once at startup and handed to [`crate::scanner::PortScanner`]; nothing downstream
/// reads the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    pub dial_timeout: Duration,
    pub retry_timeout: Duration,
    pub retry_delay: Duration,
    pub max_retries: u32,
    pub workers: usize,
    pub progress_interval: Duration,
    pub queue_slots_per_worker: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            retry_timeout: DEFAULT_RETRY_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
            workers: DEFAULT_WORKERS,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            queue_slots_per_worker: DEFAULT_QUEUE_SLOTS_PER_WORKER,
        }
    }
}

impl ScanConfig {
    /// Read the `SCAN_*` variables from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. Missing, unparsable or non-positive values
    /// silently keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let positive = |name: &str| -> Option<u64> {
            let raw = lookup(name)?;
            match raw.trim().parse::<u64>() {
                Ok(v) if v > 0 => Some(v),
                _ => None,
            }
        };
        let millis = |name: &str, fallback: Duration| {
            positive(name).map(Duration::from_millis).unwrap_or(fallback)
        };

        let defaults = Self::default();
        Self {
            dial_timeout: millis("SCAN_TIMEOUT_MS", defaults.dial_timeout),
            retry_timeout: millis("SCAN_RETRY_TIMEOUT_MS", defaults.retry_timeout),
            retry_delay: millis("SCAN_RETRY_DELAY_MS", defaults.retry_delay),
            max_retries: positive("SCAN_RETRIES")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(defaults.max_retries),
            workers: positive("SCAN_WORKERS")
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(defaults.workers),
            ..defaults
        }
    }

    pub fn dial_policy(&self) -> DialPolicy {
        DialPolicy {
            timeout: self.dial_timeout,
            retry_timeout: self.retry_timeout,
            retry_delay: self.retry_delay,
            max_retries: self.max_retries,
        }
    }

    /// Worker count for a scan of `total_ports`, clamped to `[1, total_ports]`.
    pub fn workers_for(&self, total_ports: u16) -> usize {
        self.workers.clamp(1, usize::from(total_ports).max(1))
    }
}

/// Process-level configuration for the agent binary.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub database_url: String,
    pub tick_interval: Duration,
    pub scan: ScanConfig,
}
