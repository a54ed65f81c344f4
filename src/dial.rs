use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Opens (and immediately drops) a TCP connection. The seam the engine dials through.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: SocketAddr, timeout: Duration) -> io::Result<()>;
}

/// Plain tokio TCP connect bounded by `tokio::time::timeout`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: SocketAddr, timeout: Duration) -> io::Result<()> {
        match time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                drop(stream);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::new(ErrorKind::TimedOut, "connect timed out")),
        }
    }
}

/// Timing for one port: attempt 0 uses `timeout`, retries use `retry_timeout`
/// after a fixed `retry_delay` pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialPolicy {
    pub timeout: Duration,
    pub retry_timeout: Duration,
    pub retry_delay: Duration,
    pub max_retries: u32,
}

/// Dial `addr` under `policy` and report whether it accepted a connection.
///
/// Only transient failures (see [`is_transient`]) are retried; a refused or otherwise
/// unclassified failure is "closed" immediately. A raised `cancel` short-circuits
/// before every attempt.
pub async fn probe<C>(
    connector: &C,
    addr: SocketAddr,
    policy: &DialPolicy,
    cancel: &CancellationToken,
) -> bool
where
    C: Connector + ?Sized,
{
    let mut timeout = policy.timeout;

    for attempt in 0..=policy.max_retries {
        if cancel.is_cancelled() {
            return false;
        }

        match connector.connect(addr, timeout).await {
            Ok(()) => return true,
            Err(e) if attempt < policy.max_retries && is_transient(&e) => {
                trace!(%addr, attempt, error = %e, "transient dial failure, retrying");
                timeout = policy.retry_timeout;
                if !policy.retry_delay.is_zero() {
                    time::sleep(policy.retry_delay).await;
                }
            }
            Err(_) => return false,
        }
    }

    false
}

const TRANSIENT_MESSAGES: &[&str] = &[
    "too many open files",
    "cannot assign requested address",
    "resource temporarily unavailable",
    "address already in use",
];

/// Whether a dial failure looks like local exhaustion or a timeout rather than a real answer
/// from the target.
pub fn is_transient(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        ErrorKind::TimedOut
            | ErrorKind::WouldBlock
            | ErrorKind::Interrupted
            | ErrorKind::AddrInUse
            | ErrorKind::AddrNotAvailable
    ) {
        return true;
    }

    let message = err.to_string().to_lowercase();
    TRANSIENT_MESSAGES.iter().any(|m| message.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_and_local_exhaustion_are_transient() {
        assert!(is_transient(&io::Error::new(ErrorKind::TimedOut, "x")));
        assert!(is_transient(&io::Error::new(ErrorKind::WouldBlock, "x")));
        assert!(is_transient(&io::Error::new(ErrorKind::AddrNotAvailable, "x")));
        assert!(is_transient(&io::Error::other("Too many open files (os error 24)")));
        assert!(is_transient(&io::Error::other(
            "Resource temporarily unavailable (os error 11)"
        )));
        assert!(is_transient(&io::Error::other("Address already in use")));
    }

    #[test]
    fn refused_and_unreachable_are_permanent() {
        assert!(!is_transient(&io::Error::new(
            ErrorKind::ConnectionRefused,
            "Connection refused (os error 111)"
        )));
        assert!(!is_transient(&io::Error::other("No route to host (os error 113)")));
    }
}
