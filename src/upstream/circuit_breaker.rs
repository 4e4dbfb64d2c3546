use super::Upstream;
use crate::error::ProxyError;
use crate::timeout::Phase;
use dashmap::DashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Tuning for one breaker instance. Not exposed in the config file; the
/// manager derives `per_call_timeout` from the timeout policy's total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed that trip the breaker.
    pub failure_threshold: u32,
    /// How long Open lasts before a probe is allowed.
    pub recovery_timeout: Duration,
    /// Concurrent probes admitted while HalfOpen.
    pub half_open_max_requests: u32,
    /// Deadline applied to every call executed through the breaker.
    pub per_call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(10),
            half_open_max_requests: 1,
            per_call_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    half_open_inflight: u32,
}

/// Three-state breaker guarding calls to one upstream.
///
/// Closed → Open after `failure_threshold` consecutive failures;
/// Open → HalfOpen once `recovery_timeout` has passed since the last
/// failure; a single HalfOpen success closes it, a HalfOpen failure
/// reopens it. Every transition happens under `inner`'s lock, which is
/// never held across an await.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                half_open_inflight: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().unwrap().failure_count
    }

    /// Run `op` under the breaker: admission check first, then the
    /// per-call deadline, then success/failure accounting. The original
    /// error is re-raised; a fast-failed call never polls `op`.
    pub async fn execute<T, F>(&self, op: F) -> Result<T, ProxyError>
    where
        F: Future<Output = Result<T, ProxyError>>,
    {
        self.admit()?;
        match tokio::time::timeout(self.config.per_call_timeout, op).await {
            Ok(Ok(value)) => {
                self.on_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                self.on_failure();
                Err(err)
            }
            Err(_) => {
                self.on_failure();
                Err(ProxyError::Timeout(Phase::Total))
            }
        }
    }

    fn open_error(&self) -> ProxyError {
        ProxyError::CircuitOpen {
            name: self.name.clone(),
        }
    }

    fn admit(&self) -> Result<(), ProxyError> {
        let mut inner = self.inner.lock().unwrap();

        if inner.state == CircuitState::Open {
            let recovered = inner
                .last_failure
                .map_or(false, |at| at.elapsed() >= self.config.recovery_timeout);
            if !recovered {
                return Err(self.open_error());
            }
            inner.state = CircuitState::HalfOpen;
            inner.half_open_inflight = 0;
            info!(breaker = %self.name, "circuit half-open, probing upstream");
        }

        if inner.state == CircuitState::HalfOpen {
            if inner.half_open_inflight >= self.config.half_open_max_requests {
                return Err(self.open_error());
            }
            inner.half_open_inflight += 1;
        }

        Ok(())
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.half_open_inflight = 0;
                info!(breaker = %self.name, "circuit closed, upstream recovered");
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.half_open_inflight = 0;
                warn!(breaker = %self.name, "circuit reopened, probe failed");
            }
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    "circuit opened"
                );
            }
            _ => {}
        }
    }
}

/// One breaker per upstream, created on first observation and kept for the
/// manager's lifetime.
pub struct CircuitBreakerManager {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerManager {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    pub fn breaker(&self, upstream: &Upstream) -> Arc<CircuitBreaker> {
        let key = upstream.to_string();
        // Fast path: no allocation of a new breaker once the entry exists.
        if let Some(entry) = self.breakers.get(&key) {
            return entry.value().clone();
        }
        self.breakers
            .entry(key.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.config)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn quick_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_millis(50),
            half_open_max_requests: 1,
            per_call_timeout: Duration::from_secs(5),
        }
    }

    fn io_failure() -> ProxyError {
        ProxyError::Connect(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connection refused",
        ))
    }

    #[test]
    fn starts_closed() {
        let breaker = CircuitBreaker::new("a:80", quick_config());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn trips_after_threshold_failures() {
        let breaker = CircuitBreaker::new("a:80", quick_config());
        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new("a:80", quick_config());
        breaker.on_failure();
        breaker.on_failure();
        breaker.on_success();
        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn open_breaker_fast_fails_without_running_op() {
        let breaker = CircuitBreaker::new("a:80", quick_config());
        for _ in 0..3 {
            let _ = breaker.execute(async { Err::<(), _>(io_failure()) }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let ran = AtomicBool::new(false);
        let result = breaker
            .execute(async {
                ran.store(true, Ordering::SeqCst);
                Ok::<_, ProxyError>(())
            })
            .await;
        assert!(matches!(result, Err(ProxyError::CircuitOpen { .. })));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn recovers_through_half_open_on_success() {
        let breaker = CircuitBreaker::new("a:80", quick_config());
        for _ in 0..3 {
            let _ = breaker.execute(async { Err::<(), _>(io_failure()) }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let result = breaker.execute(async { Ok::<_, ProxyError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("a:80", quick_config());
        for _ in 0..3 {
            let _ = breaker.execute(async { Err::<(), _>(io_failure()) }).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let result = breaker.execute(async { Err::<(), _>(io_failure()) }).await;
        assert!(result.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_inflight_is_capped() {
        let breaker = CircuitBreaker::new("a:80", quick_config());
        for _ in 0..3 {
            breaker.on_failure();
        }
        std::thread::sleep(Duration::from_millis(60));

        // First admission wins the probe slot, the second is refused.
        assert!(breaker.admit().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(matches!(
            breaker.admit(),
            Err(ProxyError::CircuitOpen { .. })
        ));
    }

    #[tokio::test]
    async fn per_call_timeout_counts_as_failure() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            per_call_timeout: Duration::from_millis(10),
            ..quick_config()
        };
        let breaker = CircuitBreaker::new("a:80", config);
        let result = breaker
            .execute(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, ProxyError>(())
            })
            .await;
        assert!(matches!(result, Err(ProxyError::Timeout(Phase::Total))));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn manager_returns_same_breaker_for_same_upstream() {
        let manager = CircuitBreakerManager::new(quick_config());
        let a = Upstream::new("127.0.0.1", 9001);
        let b = Upstream::new("127.0.0.1", 9002);
        let first = manager.breaker(&a);
        let second = manager.breaker(&a);
        let other = manager.breaker(&b);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(first.name(), "127.0.0.1:9001");
    }
}
