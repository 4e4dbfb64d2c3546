use crate::timeout::Phase;
use dashmap::DashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const STATUS_CLASSES: [&str; 4] = ["2xx", "3xx", "4xx", "5xx"];
const TIMEOUT_PHASES: [Phase; 4] = [Phase::Connect, Phase::Read, Phase::Write, Phase::Total];

/// Counters and the request-duration summary, updated by the request
/// engine and rendered in Prometheus text format for the metrics endpoint.
///
/// Constructor-injected (one `Arc<ProxyMetrics>` owned by the listener);
/// there is no global recorder. Scalar counters are atomics; labelled
/// families live in sharded maps whose locks are held only for the bump,
/// never across I/O. Counters survive config reloads.
#[derive(Debug, Default)]
pub struct ProxyMetrics {
    requests_total: AtomicU64,
    parse_errors_total: AtomicU64,
    responses_by_class: [AtomicU64; 4],
    duration_sum_nanos: AtomicU64,
    duration_count: AtomicU64,
    bytes_sent_total: AtomicU64,
    upstream_requests: DashMap<String, u64>,
    upstream_errors: DashMap<(String, &'static str), u64>,
    timeout_errors: [AtomicU64; 4],
}

fn class_index(status: u16) -> usize {
    match status {
        0..=299 => 0,
        300..=399 => 1,
        400..=499 => 2,
        _ => 3,
    }
}

fn phase_index(phase: Phase) -> usize {
    match phase {
        Phase::Connect => 0,
        Phase::Read => 1,
        Phase::Write => 2,
        Phase::Total => 3,
    }
}

impl ProxyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A request head was parsed and processing began.
    pub fn record_request_start(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    /// A request finished with a response streamed from the upstream (or a
    /// proxy-generated status counted separately via
    /// `record_response_status`).
    pub fn record_request_done(&self, elapsed: Duration, status: u16, upstream: &str, bytes: u64) {
        self.duration_sum_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.duration_count.fetch_add(1, Ordering::Relaxed);
        self.responses_by_class[class_index(status)].fetch_add(1, Ordering::Relaxed);
        self.bytes_sent_total.fetch_add(bytes, Ordering::Relaxed);
        *self
            .upstream_requests
            .entry(upstream.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_parse_error(&self) {
        self.parse_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// `kind` is the error taxonomy label: `timeout`,
    /// `connection_refused`, `network`, `circuit`, `client`, `other`.
    pub fn record_upstream_error(&self, upstream: &str, kind: &'static str) {
        *self
            .upstream_errors
            .entry((upstream.to_string(), kind))
            .or_insert(0) += 1;
    }

    pub fn record_timeout(&self, phase: Phase) {
        self.timeout_errors[phase_index(phase)].fetch_add(1, Ordering::Relaxed);
    }

    /// Count the class of a proxy-generated response (502/504 emitted on a
    /// failed forward).
    pub fn record_response_status(&self, status: u16) {
        self.responses_by_class[class_index(status)].fetch_add(1, Ordering::Relaxed);
    }

    // -- observers (tests and logging) --

    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn parse_errors_total(&self) -> u64 {
        self.parse_errors_total.load(Ordering::Relaxed)
    }

    pub fn bytes_sent_total(&self) -> u64 {
        self.bytes_sent_total.load(Ordering::Relaxed)
    }

    pub fn responses_for_class(&self, class: &str) -> u64 {
        STATUS_CLASSES
            .iter()
            .position(|&c| c == class)
            .map(|i| self.responses_by_class[i].load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn upstream_requests(&self, upstream: &str) -> u64 {
        self.upstream_requests
            .get(upstream)
            .map(|v| *v)
            .unwrap_or(0)
    }

    pub fn upstream_errors(&self, upstream: &str, kind: &'static str) -> u64 {
        self.upstream_errors
            .get(&(upstream.to_string(), kind))
            .map(|v| *v)
            .unwrap_or(0)
    }

    pub fn timeout_errors(&self, phase: Phase) -> u64 {
        self.timeout_errors[phase_index(phase)].load(Ordering::Relaxed)
    }

    /// Prometheus text exposition of every family.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(1024);

        writeln!(out, "# TYPE proxy_requests_total counter").ok();
        writeln!(out, "proxy_requests_total {}", self.requests_total()).ok();

        writeln!(out, "# TYPE proxy_requests_parse_errors_total counter").ok();
        writeln!(
            out,
            "proxy_requests_parse_errors_total {}",
            self.parse_errors_total()
        )
        .ok();

        writeln!(out, "# TYPE proxy_responses_total counter").ok();
        for (i, class) in STATUS_CLASSES.iter().enumerate() {
            writeln!(
                out,
                "proxy_responses_total{{status_class=\"{}\"}} {}",
                class,
                self.responses_by_class[i].load(Ordering::Relaxed)
            )
            .ok();
        }

        writeln!(out, "# TYPE proxy_request_duration_seconds summary").ok();
        let sum_secs = self.duration_sum_nanos.load(Ordering::Relaxed) as f64 / 1e9;
        writeln!(out, "proxy_request_duration_seconds_sum {:.6}", sum_secs).ok();
        writeln!(
            out,
            "proxy_request_duration_seconds_count {}",
            self.duration_count.load(Ordering::Relaxed)
        )
        .ok();

        writeln!(out, "# TYPE proxy_bytes_sent_total counter").ok();
        writeln!(out, "proxy_bytes_sent_total {}", self.bytes_sent_total()).ok();

        writeln!(out, "# TYPE proxy_upstream_requests_total counter").ok();
        let mut upstream_rows: Vec<(String, u64)> = self
            .upstream_requests
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        upstream_rows.sort();
        for (upstream, count) in upstream_rows {
            writeln!(
                out,
                "proxy_upstream_requests_total{{upstream=\"{}\"}} {}",
                upstream, count
            )
            .ok();
        }

        writeln!(out, "# TYPE proxy_upstream_errors_total counter").ok();
        let mut error_rows: Vec<((String, &'static str), u64)> = self
            .upstream_errors
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        error_rows.sort();
        for ((upstream, kind), count) in error_rows {
            writeln!(
                out,
                "proxy_upstream_errors_total{{upstream=\"{}\",type=\"{}\"}} {}",
                upstream, kind, count
            )
            .ok();
        }

        writeln!(out, "# TYPE proxy_timeout_errors_total counter").ok();
        for phase in TIMEOUT_PHASES {
            writeln!(
                out,
                "proxy_timeout_errors_total{{type=\"{}\"}} {}",
                phase.as_str(),
                self.timeout_errors(phase)
            )
            .ok();
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classes_bucket_correctly() {
        let metrics = ProxyMetrics::new();
        metrics.record_request_done(Duration::from_millis(10), 204, "a:1", 0);
        metrics.record_request_done(Duration::from_millis(10), 301, "a:1", 0);
        metrics.record_request_done(Duration::from_millis(10), 404, "a:1", 0);
        metrics.record_response_status(502);
        assert_eq!(metrics.responses_for_class("2xx"), 1);
        assert_eq!(metrics.responses_for_class("3xx"), 1);
        assert_eq!(metrics.responses_for_class("4xx"), 1);
        assert_eq!(metrics.responses_for_class("5xx"), 1);
    }

    #[test]
    fn request_done_updates_all_families() {
        let metrics = ProxyMetrics::new();
        metrics.record_request_start();
        metrics.record_request_done(Duration::from_millis(250), 200, "127.0.0.1:9001", 512);
        assert_eq!(metrics.requests_total(), 1);
        assert_eq!(metrics.bytes_sent_total(), 512);
        assert_eq!(metrics.upstream_requests("127.0.0.1:9001"), 1);
        assert_eq!(metrics.upstream_requests("127.0.0.1:9999"), 0);
    }

    #[test]
    fn render_contains_every_family() {
        let metrics = ProxyMetrics::new();
        metrics.record_request_start();
        metrics.record_request_done(Duration::from_millis(100), 200, "127.0.0.1:9001", 64);
        metrics.record_parse_error();
        metrics.record_upstream_error("127.0.0.1:9002", "connection_refused");
        metrics.record_timeout(Phase::Read);

        let text = metrics.render();
        assert!(text.contains("proxy_requests_total 1"));
        assert!(text.contains("proxy_requests_parse_errors_total 1"));
        assert!(text.contains("proxy_responses_total{status_class=\"2xx\"} 1"));
        assert!(text.contains("proxy_request_duration_seconds_sum 0.100000"));
        assert!(text.contains("proxy_request_duration_seconds_count 1"));
        assert!(text.contains("proxy_bytes_sent_total 64"));
        assert!(text.contains("proxy_upstream_requests_total{upstream=\"127.0.0.1:9001\"} 1"));
        assert!(text.contains(
            "proxy_upstream_errors_total{upstream=\"127.0.0.1:9002\",type=\"connection_refused\"} 1"
        ));
        assert!(text.contains("proxy_timeout_errors_total{type=\"read\"} 1"));
        assert!(text.contains("proxy_timeout_errors_total{type=\"connect\"} 0"));
    }

    #[test]
    fn timeout_phases_are_independent() {
        let metrics = ProxyMetrics::new();
        metrics.record_timeout(Phase::Connect);
        metrics.record_timeout(Phase::Total);
        metrics.record_timeout(Phase::Total);
        assert_eq!(metrics.timeout_errors(Phase::Connect), 1);
        assert_eq!(metrics.timeout_errors(Phase::Read), 0);
        assert_eq!(metrics.timeout_errors(Phase::Total), 2);
    }
}
