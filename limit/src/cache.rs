//! Process-wide cache of resolved limit sets with single-flight fills.
//!
//! Entries are keyed by project id and hold a fully materialized [`ProjectLimitSet`] behind an
//! `Arc`, swapped whole under a write lock so readers never see a partial set. A miss
//! registers one pending resolution per project in the in-flight map; callers arriving while
//! it runs attach to the same [`Shared`] future instead of fetching again.
//!
//! Lock order is always in-flight map, then entries.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{Mutex, RwLock};

use crate::error::LimitError;
use crate::model::ProjectLimitSet;

type Resolution = Result<Arc<ProjectLimitSet>, LimitError>;
type PendingResolution = Shared<BoxFuture<'static, Resolution>>;

struct CacheEntry {
    set: Arc<ProjectLimitSet>,
    stored_at: Instant,
}

struct Flight {
    generation: u64,
    pending: PendingResolution,
}

struct Inner {
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
    in_flight: Mutex<HashMap<String, Flight>>,
    next_generation: AtomicU64,
}

impl Inner {
    async fn fresh(&self, project_id: &str) -> Option<Arc<ProjectLimitSet>> {
        let entries = self.entries.read().await;
        entries
            .get(project_id)
            .filter(|e| e.stored_at.elapsed() < self.ttl)
            .map(|e| Arc::clone(&e.set))
    }

    /// Publishes a finished flight. A flight detached by `invalidate` (or superseded) leaves
    /// the cache untouched.
    async fn complete(&self, project_id: &str, generation: u64, result: &Resolution) {
        let mut in_flight = self.in_flight.lock().await;
        let current = in_flight
            .get(project_id)
            .is_some_and(|f| f.generation == generation);
        if !current {
            tracing::debug!(project_id, generation, "detached limit resolution finished");
            return;
        }
        if let Ok(set) = result {
            self.entries.write().await.insert(
                project_id.to_string(),
                CacheEntry {
                    set: Arc::clone(set),
                    stored_at: Instant::now(),
                },
            );
        }
        in_flight.remove(project_id);
    }
}

/// Time-bounded, single-flight cache of [`ProjectLimitSet`]s. Cloning shares the cache.
#[derive(Clone)]
pub struct LimitCache {
    inner: Arc<Inner>,
}

impl LimitCache {
    /// Entries older than `ttl` are replaced on next access. A zero `ttl` never serves hits.
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                ttl,
                entries: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Returns the fresh cached set, or runs `resolve` (at most once across concurrent
    /// callers for the same project) and caches its success. Failures reach every waiter
    /// and are not cached.
    pub async fn get_or_resolve<F, Fut>(
        &self,
        project_id: &str,
        resolve: F,
    ) -> Result<Arc<ProjectLimitSet>, LimitError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ProjectLimitSet, LimitError>> + Send + 'static,
    {
        if let Some(set) = self.inner.fresh(project_id).await {
            tracing::debug!(project_id, "limit cache hit");
            return Ok(set);
        }

        let pending = {
            let mut in_flight = self.inner.in_flight.lock().await;
            // A flight may have completed between the read above and taking the lock.
            if let Some(set) = self.inner.fresh(project_id).await {
                return Ok(set);
            }
            match in_flight.get(project_id) {
                Some(flight) => {
                    tracing::debug!(project_id, "joining in-flight limit resolution");
                    flight.pending.clone()
                }
                None => {
                    let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(project_id, generation, "limit cache miss, resolving");
                    // The flight sits in `in_flight`, so it must not keep `Inner` alive.
                    let inner = Arc::downgrade(&self.inner);
                    let key = project_id.to_string();
                    let fut = resolve();
                    let pending = async move {
                        let result = fut.await.map(Arc::new);
                        if let Some(inner) = inner.upgrade() {
                            inner.complete(&key, generation, &result).await;
                        }
                        result
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(
                        project_id.to_string(),
                        Flight {
                            generation,
                            pending: pending.clone(),
                        },
                    );
                    pending
                }
            }
        };

        pending.await
    }

    /// Drops the cached set and detaches any in-flight resolution for `project_id`, so the
    /// next call fetches again. Returns whether anything was dropped.
    pub async fn invalidate(&self, project_id: &str) -> bool {
        let mut in_flight = self.inner.in_flight.lock().await;
        let detached = in_flight.remove(project_id).is_some();
        let dropped = self.inner.entries.write().await.remove(project_id).is_some();
        tracing::info!(project_id, dropped, detached, "limit cache invalidated");
        dropped || detached
    }

    /// Drops every cached set and detaches all in-flight resolutions.
    pub async fn clear(&self) {
        let mut in_flight = self.inner.in_flight.lock().await;
        in_flight.clear();
        self.inner.entries.write().await.clear();
    }

    /// Cached set for `project_id`, fresh or not, without resolving.
    pub async fn peek(&self, project_id: &str) -> Option<Arc<ProjectLimitSet>> {
        self.inner
            .entries
            .read()
            .await
            .get(project_id)
            .map(|e| Arc::clone(&e.set))
    }

    /// Number of cached projects.
    pub async fn len(&self) -> usize {
        self.inner.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    use chrono::Utc;

    use super::*;

    fn set(project_id: &str) -> ProjectLimitSet {
        ProjectLimitSet {
            project_id: project_id.to_string(),
            limits: BTreeMap::new(),
            resolved_at: Utc::now(),
        }
    }

    fn counting_resolver(
        calls: Arc<AtomicUsize>,
        project_id: &'static str,
        delay: Duration,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<ProjectLimitSet, LimitError>> {
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Ok(set(project_id))
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn hit_within_ttl_skips_resolution() {
        let cache = LimitCache::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let got = cache
                .get_or_resolve("alpha", counting_resolver(calls.clone(), "alpha", Duration::ZERO))
                .await
                .unwrap();
            assert_eq!(got.project_id, "alpha");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn zero_ttl_always_resolves() {
        let cache = LimitCache::new(Duration::ZERO);
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            cache
                .get_or_resolve("alpha", counting_resolver(calls.clone(), "alpha", Duration::ZERO))
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_resolution() {
        let cache = LimitCache::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_resolve(
                        "alpha",
                        counting_resolver(calls, "alpha", Duration::from_millis(50)),
                    )
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap().project_id, "alpha");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_reaches_all_waiters_and_is_not_cached() {
        let cache = LimitCache::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let failing = |calls: Arc<AtomicUsize>| {
            move || {
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Err::<ProjectLimitSet, _>(LimitError::RegistryUnavailable("down".into()))
                }
                .boxed()
            }
        };

        let (a, b) = tokio::join!(
            cache.get_or_resolve("alpha", failing(calls.clone())),
            cache.get_or_resolve("alpha", failing(calls.clone())),
        );
        assert!(matches!(a, Err(LimitError::RegistryUnavailable(_))));
        assert!(matches!(b, Err(LimitError::RegistryUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.peek("alpha").await.is_none());

        cache
            .get_or_resolve("alpha", counting_resolver(calls.clone(), "alpha", Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let cache = LimitCache::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));
        cache
            .get_or_resolve("alpha", counting_resolver(calls.clone(), "alpha", Duration::ZERO))
            .await
            .unwrap();
        assert!(cache.invalidate("alpha").await);
        assert!(!cache.invalidate("alpha").await);
        cache
            .get_or_resolve("alpha", counting_resolver(calls.clone(), "alpha", Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidated_flight_does_not_populate_cache() {
        let cache = LimitCache::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let slow = {
            let cache = cache.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                cache
                    .get_or_resolve(
                        "alpha",
                        counting_resolver(calls, "alpha", Duration::from_millis(80)),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.invalidate("alpha").await);

        // The detached flight still answers its own caller.
        assert!(slow.await.unwrap().is_ok());
        assert!(cache.peek("alpha").await.is_none());
    }

    #[tokio::test]
    async fn distinct_projects_resolve_independently() {
        let cache = LimitCache::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));
        let delay = Duration::from_millis(10);
        let (a, b) = tokio::join!(
            cache.get_or_resolve("a", counting_resolver(calls.clone(), "a", delay)),
            cache.get_or_resolve("b", counting_resolver(calls.clone(), "b", delay)),
        );
        assert_eq!(a.unwrap().project_id, "a");
        assert_eq!(b.unwrap().project_id, "b");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        cache.clear().await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn abandoned_flight_does_not_keep_cache_alive() {
        let cache = LimitCache::new(Duration::from_secs(60));
        let inner = Arc::downgrade(&cache.inner);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            cache.get_or_resolve("alpha", || {
                std::future::pending::<Result<ProjectLimitSet, LimitError>>()
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(cache.inner.in_flight.lock().await.len(), 1);

        drop(cache);
        assert!(inner.upgrade().is_none());
    }
}
