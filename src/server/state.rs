use crate::config::Settings;
use crate::limits::{ConnectionLimits, LimitManager};
use crate::metrics::ProxyMetrics;
use crate::timeout::TimeoutPolicy;
use crate::upstream::{CircuitBreakerConfig, CircuitBreakerManager, UpstreamPool};
use anyhow::Result;
use arc_swap::ArcSwap;
use std::sync::Arc;

/// Everything derived from one loaded configuration: the pool, the
/// timeout policy, both gate levels and the breaker registry. Built once
/// per (re)load and swapped in atomically; each request pins the bundle
/// it started with, so in-flight requests keep their original policy and
/// gates until completion.
pub struct ActiveConfig {
    pub settings: Settings,
    pub pool: UpstreamPool,
    pub timeouts: TimeoutPolicy,
    pub limits: LimitManager,
    pub breakers: CircuitBreakerManager,
}

impl ActiveConfig {
    pub fn build(settings: Settings) -> Result<Self> {
        let pool = UpstreamPool::new(settings.upstreams.clone())?;
        let timeouts = TimeoutPolicy::from_millis(
            settings.timeouts.connect_ms,
            settings.timeouts.read_ms,
            settings.timeouts.write_ms,
            settings.timeouts.total_ms,
        );
        let limits = LimitManager::new(ConnectionLimits {
            max_client_conns: settings.limits.max_client_conns,
            max_conns_per_upstream: settings.limits.max_conns_per_upstream,
        });
        // The engine's total deadline is the effective per-call bound, so
        // the breaker inherits it rather than carrying a tighter one.
        let breakers = CircuitBreakerManager::new(CircuitBreakerConfig {
            per_call_timeout: timeouts.total,
            ..CircuitBreakerConfig::default()
        });
        Ok(Self {
            settings,
            pool,
            timeouts,
            limits,
            breakers,
        })
    }
}

/// Shared server state, cheaply cloneable into every connection task.
/// The metrics sink lives outside the config bundle: counters are
/// continuous across reloads.
#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<ArcSwap<ActiveConfig>>,
    pub metrics: Arc<ProxyMetrics>,
}

impl ProxyState {
    pub fn new(active: ActiveConfig) -> Self {
        Self {
            config: Arc::new(ArcSwap::from_pointee(active)),
            metrics: Arc::new(ProxyMetrics::new()),
        }
    }

    /// Swap in a freshly built bundle; connections accepted from now on
    /// see it.
    pub fn install(&self, active: ActiveConfig) {
        self.config.store(Arc::new(active));
    }
}
