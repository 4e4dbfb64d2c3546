use crate::error::ProxyError;
use std::future::Future;
use std::time::Duration;

/// I/O phase a timeout applies to. Doubles as the `type` label on
/// `proxy_timeout_errors_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Read,
    Write,
    Total,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Connect => "connect",
            Phase::Read => "read",
            Phase::Write => "write",
            Phase::Total => "total",
        }
    }
}

/// Per-phase deadlines for one proxied request.
///
/// `connect` bounds TCP establishment to the upstream, `write` the whole
/// request transmission (head + body), `read` a single chunk read from the
/// upstream, and `total` the entire proxy phase. A policy is a value:
/// built once from config, copied into each request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub connect: Duration,
    pub read: Duration,
    pub write: Duration,
    pub total: Duration,
}

impl TimeoutPolicy {
    pub fn from_millis(connect_ms: u64, read_ms: u64, write_ms: u64, total_ms: u64) -> Self {
        Self {
            connect: Duration::from_millis(connect_ms),
            read: Duration::from_millis(read_ms),
            write: Duration::from_millis(write_ms),
            total: Duration::from_millis(total_ms),
        }
    }

    /// Bound TCP establishment to one upstream.
    pub async fn connect<F: Future>(&self, fut: F) -> Result<F::Output, ProxyError> {
        wrap(self.connect, Phase::Connect, fut).await
    }

    /// Bound a single chunk read from the upstream.
    pub async fn read<F: Future>(&self, fut: F) -> Result<F::Output, ProxyError> {
        wrap(self.read, Phase::Read, fut).await
    }

    /// Bound the full request write to the upstream.
    pub async fn write<F: Future>(&self, fut: F) -> Result<F::Output, ProxyError> {
        wrap(self.write, Phase::Write, fut).await
    }

    /// Bound the whole proxy-to-upstream activity.
    pub async fn total<F: Future>(&self, fut: F) -> Result<F::Output, ProxyError> {
        wrap(self.total, Phase::Total, fut).await
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::from_millis(1000, 15_000, 15_000, 30_000)
    }
}

/// On elapse the inner future is dropped, which cancels any pending I/O
/// and closes sockets it owns.
async fn wrap<F: Future>(limit: Duration, phase: Phase, fut: F) -> Result<F::Output, ProxyError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| ProxyError::Timeout(phase))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn completes_within_deadline() {
        let policy = TimeoutPolicy::from_millis(50, 50, 50, 50);
        let out = policy.read(async { 7u32 }).await.unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn elapse_reports_phase() {
        let policy = TimeoutPolicy::from_millis(10, 10, 10, 10);
        let err = policy
            .connect(tokio::time::sleep(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Timeout(Phase::Connect)));

        let err = policy
            .total(tokio::time::sleep(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Timeout(Phase::Total)));
    }

    #[tokio::test]
    async fn elapse_cancels_inner_future() {
        let policy = TimeoutPolicy::from_millis(10, 10, 10, 10);
        let start = Instant::now();
        let _ = policy.read(tokio::time::sleep(Duration::from_secs(10))).await;
        // The 10s sleep was dropped, not awaited to completion.
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
