use super::Upstream;
use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Round-robin over a fixed, non-empty upstream list.
///
/// The cursor is a monotonically advancing atomic; `fetch_add` guarantees
/// at most one advance per call, so over any window of `k * n` calls each
/// upstream is handed out exactly `k` times.
pub struct UpstreamPool {
    upstreams: Vec<Upstream>,
    cursor: AtomicUsize,
}

impl UpstreamPool {
    pub fn new(upstreams: Vec<Upstream>) -> Result<Self> {
        if upstreams.is_empty() {
            anyhow::bail!("upstream pool must contain at least one upstream");
        }
        Ok(Self {
            upstreams,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Hand out the next upstream in cyclic order.
    pub fn next(&self) -> Upstream {
        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.upstreams[n % self.upstreams.len()].clone()
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }

    pub fn upstreams(&self) -> &[Upstream] {
        &self.upstreams
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn pool_of(ports: &[u16]) -> UpstreamPool {
        UpstreamPool::new(
            ports
                .iter()
                .map(|&p| Upstream::new("127.0.0.1", p))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn rejects_empty_list() {
        assert!(UpstreamPool::new(Vec::new()).is_err());
    }

    #[test]
    fn single_upstream_always_returned() {
        let pool = pool_of(&[9001]);
        for _ in 0..10 {
            assert_eq!(pool.next().port, 9001);
        }
    }

    #[test]
    fn cycles_in_order() {
        let pool = pool_of(&[9001, 9002, 9003]);
        let ports: Vec<u16> = (0..6).map(|_| pool.next().port).collect();
        assert_eq!(ports, vec![9001, 9002, 9003, 9001, 9002, 9003]);
    }

    #[test]
    fn fair_over_any_multiple_of_len() {
        let pool = pool_of(&[9001, 9002]);
        let mut counts = HashMap::new();
        for _ in 0..1000 {
            *counts.entry(pool.next().port).or_insert(0) += 1;
        }
        assert_eq!(counts[&9001], 500);
        assert_eq!(counts[&9002], 500);
    }

    #[tokio::test]
    async fn fair_under_concurrent_callers() {
        let pool = Arc::new(pool_of(&[9001, 9002, 9003, 9004]));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                (0..100).map(|_| pool.next().port).collect::<Vec<_>>()
            }));
        }
        let mut counts = HashMap::new();
        for handle in handles {
            for port in handle.await.unwrap() {
                *counts.entry(port).or_insert(0) += 1;
            }
        }
        // 800 calls over 4 upstreams: exactly 200 each.
        for port in [9001, 9002, 9003, 9004] {
            assert_eq!(counts[&port], 200);
        }
    }
}
