#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use portwatch::config::ScanConfig;
use portwatch::dial::Connector;

/// Scripted host: listed ports accept, everything else refuses.
#[derive(Default)]
pub struct FakeHost {
    open: HashSet<u16>,
    /// Ports that fail this many times with a timeout before answering normally.
    flaky: Mutex<HashMap<u16, usize>>,
    /// Ports that always fail with the given error kind.
    failing: HashMap<u16, ErrorKind>,
    attempts: Mutex<HashMap<u16, usize>>,
    total_attempts: AtomicUsize,
    latency: Option<Duration>,
}

impl FakeHost {
    pub fn with_open(ports: &[u16]) -> Self {
        Self {
            open: ports.iter().copied().collect(),
            ..Self::default()
        }
    }

    pub fn flaky(self, port: u16, failures: usize) -> Self {
        self.flaky.lock().unwrap().insert(port, failures);
        self
    }

    pub fn failing(mut self, port: u16, kind: ErrorKind) -> Self {
        self.failing.insert(port, kind);
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn attempts(&self, port: u16) -> usize {
        self.attempts.lock().unwrap().get(&port).copied().unwrap_or(0)
    }

    pub fn total_attempts(&self) -> usize {
        self.total_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeHost {
    async fn connect(&self, addr: SocketAddr, _timeout: Duration) -> io::Result<()> {
        let port = addr.port();
        *self.attempts.lock().unwrap().entry(port).or_insert(0) += 1;
        self.total_attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(kind) = self.failing.get(&port) {
            return Err(io::Error::new(*kind, "scripted failure"));
        }

        {
            let mut flaky = self.flaky.lock().unwrap();
            if let Some(left) = flaky.get_mut(&port) {
                if *left > 0 {
                    *left -= 1;
                    return Err(io::Error::new(ErrorKind::TimedOut, "connect timed out"));
                }
            }
        }

        if self.open.contains(&port) {
            Ok(())
        } else {
            Err(io::Error::new(ErrorKind::ConnectionRefused, "Connection refused (os error 111)"))
        }
    }
}

/// Small, fast engine settings for tests.
pub fn test_config(workers: usize) -> ScanConfig {
    ScanConfig {
        dial_timeout: Duration::from_millis(50),
        retry_timeout: Duration::from_millis(50),
        retry_delay: Duration::ZERO,
        max_retries: 1,
        workers,
        progress_interval: Duration::from_millis(10),
        ..ScanConfig::default()
    }
}
