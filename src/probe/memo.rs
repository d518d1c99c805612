// Single-flight probe result cache
use std::convert::Infallible;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;

/// Keyed cache where each value is computed at most once.
///
/// Claiming a key only touches the map shard that owns it, and the
/// computation itself runs outside any map lock, so distinct keys never wait
/// on one another. Callers racing on the same key share one in-flight
/// computation through the key's `OnceCell`. If that computation is dropped
/// before finishing, the next waiter runs it instead; nothing is published.
pub struct ProbeCache<K, V> {
    cells: DashMap<K, Arc<OnceCell<V>>>,
    computations: AtomicU64,
    hits: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub computations: u64,
    pub hits: u64,
}

impl CacheStats {
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.computations + self.hits;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl<K, V> Default for ProbeCache<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            cells: DashMap::new(),
            computations: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }
}

impl<K, V> ProbeCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, key: K) -> Arc<OnceCell<V>> {
        Arc::clone(
            self.cells
                .entry(key)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .value(),
        )
    }

    /// Return the published value for `key`, if any.
    pub fn get(&self, key: &K) -> Option<V> {
        self.cells
            .get(key)
            .and_then(|cell| cell.value().get().cloned())
    }

    /// Return the value for `key`, running `compute` only if no value has
    /// been published and no other caller is computing it.
    pub async fn get_or_compute<F, Fut>(&self, key: K, compute: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let result = self
            .get_or_try_compute(key, || async { Ok::<V, Infallible>(compute().await) })
            .await;
        match result {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Like `get_or_compute`, but an `Err` from `compute` is returned to the
    /// caller that ran it and is not published. The next caller computes again.
    pub async fn get_or_try_compute<F, Fut, E>(&self, key: K, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        self.get_or_try_compute_evicting(key, compute, |_| false).await
    }

    /// Like `get_or_try_compute`, but a computed value for which `evict`
    /// holds is handed to every caller that joined this computation and then
    /// dropped from the cache. Callers arriving afterwards compute again.
    pub async fn get_or_try_compute_evicting<F, Fut, E, P>(
        &self,
        key: K,
        compute: F,
        evict: P,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        P: FnOnce(&V) -> bool,
    {
        let cell = self.cell(key.clone());

        if let Some(value) = cell.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value.clone());
        }

        let mut ran = false;
        let value = cell
            .get_or_try_init(|| {
                ran = true;
                self.computations.fetch_add(1, Ordering::Relaxed);
                compute()
            })
            .await?
            .clone();

        if !ran {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else if evict(&value) {
            // Waiters already hold this cell; only its map entry goes.
            self.cells
                .remove_if(&key, |_, current| Arc::ptr_eq(current, &cell));
        }
        Ok(value)
    }

    /// Number of keys with a published value.
    pub fn len(&self) -> usize {
        self.cells
            .iter()
            .filter(|cell| cell.value().initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            computations: self.computations.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};
    use futures::future::join_all;

    #[tokio::test]
    async fn test_computes_once() {
        let cache: ProbeCache<u16, String> = ProbeCache::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_compute(3389, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    "rdp".to_string()
                })
                .await;
            assert_eq!(value, "rdp");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(&3389), Some("rdp".to_string()));
        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.computations, 1);
        assert_eq!(stats.hits, 2);
    }

    #[tokio::test]
    async fn test_concurrent_first_access_single_flight() {
        let cache: Arc<ProbeCache<u16, u64>> = Arc::new(ProbeCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks = (0..50).map(|_| {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .get_or_compute(3389, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        42
                    })
                    .await
            })
        });

        let results: Vec<u64> = join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|&v| v == 42));
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_serialize() {
        let cache: Arc<ProbeCache<u16, u16>> = Arc::new(ProbeCache::new());
        let start = Instant::now();

        let tasks = (1..=10u16).map(|port| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_compute(port, || async move {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        port
                    })
                    .await
            })
        });
        join_all(tasks).await;

        assert!(start.elapsed() < Duration::from_millis(1000));
        assert_eq!(cache.len(), 10);
    }

    #[tokio::test]
    async fn test_errors_are_not_published() {
        let cache: ProbeCache<u16, u16> = ProbeCache::new();

        let first: Result<u16, &str> = cache
            .get_or_try_compute(3389, || async { Err("refused") })
            .await;
        assert_eq!(first, Err("refused"));
        assert!(cache.get(&3389).is_none());

        let second: Result<u16, &str> = cache
            .get_or_try_compute(3389, || async { Ok(7) })
            .await;
        assert_eq!(second, Ok(7));
        assert_eq!(cache.stats().computations, 2);
    }

    #[tokio::test]
    async fn test_dropped_computation_is_taken_over() {
        let cache: Arc<ProbeCache<u16, u16>> = Arc::new(ProbeCache::new());

        let slow = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_compute(3389, || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        1
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        slow.abort();
        let _ = slow.await;

        assert!(cache.get(&3389).is_none());
        let value = cache.get_or_compute(3389, || async { 2 }).await;
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn test_evicted_value_shared_by_waiters_then_recomputed() {
        let cache: Arc<ProbeCache<u16, Result<u16, String>>> = Arc::new(ProbeCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks = (0..10).map(|_| {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .get_or_try_compute_evicting(
                        3389,
                        || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok::<_, Infallible>(Err("refused".to_string()))
                        },
                        |value| value.is_err(),
                    )
                    .await
            })
        });

        for result in join_all(tasks).await {
            assert_eq!(result.unwrap(), Ok(Err("refused".to_string())));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.get(&3389).is_none());
        assert!(cache.is_empty());

        let next = cache
            .get_or_try_compute_evicting(3389, || async { Ok::<_, Infallible>(Ok(7)) }, |v| v.is_err())
            .await;
        assert_eq!(next, Ok(Ok(7)));
        assert_eq!(cache.get(&3389), Some(Ok(7)));
        assert_eq!(cache.stats().computations, 2);
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats { entries: 1, computations: 1, hits: 3 };
        assert!((stats.cache_hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().cache_hit_rate(), 0.0);
    }
}
