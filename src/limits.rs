use crate::upstream::Upstream;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Admission-control ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    pub max_client_conns: usize,
    pub max_conns_per_upstream: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_client_conns: 1000,
            max_conns_per_upstream: 100,
        }
    }
}

/// Owns the two gate levels: one global client semaphore plus one
/// semaphore per observed upstream. A given `(host, port)` maps to the
/// same semaphore for the manager's lifetime; gates are never resized or
/// recreated. Callers hold permits (`acquire_owned`) so release happens on
/// drop, on every path.
pub struct LimitManager {
    limits: ConnectionLimits,
    client_gate: Arc<Semaphore>,
    upstream_gates: DashMap<(String, u16), Arc<Semaphore>>,
}

impl LimitManager {
    pub fn new(limits: ConnectionLimits) -> Self {
        Self {
            limits,
            client_gate: Arc::new(Semaphore::new(limits.max_client_conns)),
            upstream_gates: DashMap::new(),
        }
    }

    pub fn limits(&self) -> ConnectionLimits {
        self.limits
    }

    /// The global client gate. Acquisition suspends when
    /// `max_client_conns` permits are out.
    pub fn client_gate(&self) -> Arc<Semaphore> {
        self.client_gate.clone()
    }

    /// The per-upstream gate, created on first use. Lookups after the
    /// first are lock-free reads.
    pub fn upstream_gate(&self, upstream: &Upstream) -> Arc<Semaphore> {
        let key = (upstream.host.clone(), upstream.port);
        if let Some(gate) = self.upstream_gates.get(&key) {
            return gate.value().clone();
        }
        self.upstream_gates
            .entry(key)
            .or_insert_with(|| Arc::new(Semaphore::new(self.limits.max_conns_per_upstream)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn gates_carry_configured_capacity() {
        let manager = LimitManager::new(ConnectionLimits {
            max_client_conns: 7,
            max_conns_per_upstream: 3,
        });
        assert_eq!(manager.client_gate().available_permits(), 7);
        let upstream = Upstream::new("127.0.0.1", 9001);
        assert_eq!(manager.upstream_gate(&upstream).available_permits(), 3);
    }

    #[test]
    fn same_upstream_gets_same_gate() {
        let manager = LimitManager::new(ConnectionLimits::default());
        let a = Upstream::new("127.0.0.1", 9001);
        let b = Upstream::new("127.0.0.1", 9002);
        let first = manager.upstream_gate(&a);
        let second = manager.upstream_gate(&a);
        let other = manager.upstream_gate(&b);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[tokio::test]
    async fn client_gate_blocks_at_capacity() {
        let manager = LimitManager::new(ConnectionLimits {
            max_client_conns: 2,
            max_conns_per_upstream: 10,
        });
        let gate = manager.client_gate();
        let p1 = gate.clone().acquire_owned().await.unwrap();
        let _p2 = gate.clone().acquire_owned().await.unwrap();
        assert!(gate.clone().try_acquire_owned().is_err());

        drop(p1);
        assert!(gate.try_acquire_owned().is_ok());
    }

    #[tokio::test]
    async fn upstream_gate_bounds_concurrency() {
        let manager = Arc::new(LimitManager::new(ConnectionLimits {
            max_client_conns: 100,
            max_conns_per_upstream: 1,
        }));
        let upstream = Upstream::new("127.0.0.1", 9001);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let gate = manager.upstream_gate(&upstream);
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire_owned().await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
