use crate::upstream::Upstream;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Per-request state threaded through the engine. There is no ambient
/// context: the trace id lives here (and on the connection's tracing
/// span), and everything that logs receives it explicitly.
pub struct RequestContext {
    pub trace_id: String,
    pub peer_addr: SocketAddr,
    /// Reset once the request head has been parsed; durations are
    /// measured from there.
    pub start: Instant,
    pub upstream: Option<Upstream>,
    /// Response bytes already written to the client. Shared with the
    /// forward task so the engine can apply the first-byte rule even
    /// after a cancellation.
    pub bytes_sent: AtomicU64,
}

impl RequestContext {
    pub fn new(peer_addr: SocketAddr) -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            peer_addr,
            start: Instant::now(),
            upstream: None,
            bytes_sent: AtomicU64::new(0),
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// `host:port` of the selected upstream, for metric labels.
    pub fn upstream_key(&self) -> String {
        self.upstream
            .as_ref()
            .map(|u| u.to_string())
            .unwrap_or_default()
    }
}
