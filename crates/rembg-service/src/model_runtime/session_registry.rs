//! Session Registry
//!
//! Owns one lazily constructed session per model name. Each name maps to a
//! slot holding a `tokio::sync::OnceCell` with the outcome of one
//! construction attempt, so concurrent first requests for the same name wait
//! on a single construction while other names proceed independently. A
//! failed attempt is shared by every caller that joined it; its slot leaves
//! the map before the failure is published, so the next request starts a
//! fresh attempt. The map's shard lock is only held to find or insert a
//! slot, never while a model loads or runs.
//!
//! With a capacity configured, the least recently used session is evicted
//! once the registry grows past it, but only when nothing outside the
//! registry holds that session or its slot.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::runtime_trait::{BackgroundSession, ExecutionBackend, SessionFactory};
use crate::error::ServiceError;
use crate::metrics;

type Attempt = Result<Arc<dyn BackgroundSession>, ServiceError>;

struct SessionSlot {
    cell: OnceCell<Attempt>,
    last_used_ms: AtomicU64,
}

impl SessionSlot {
    fn new() -> Self {
        Self {
            cell: OnceCell::new(),
            last_used_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self, now_ms: u64) {
        self.last_used_ms.store(now_ms, Ordering::Relaxed);
    }

    fn last_used(&self) -> u64 {
        self.last_used_ms.load(Ordering::Relaxed)
    }

    fn session(&self) -> Option<&Arc<dyn BackgroundSession>> {
        match self.cell.get() {
            Some(Ok(session)) => Some(session),
            _ => None,
        }
    }

    fn is_loaded(&self) -> bool {
        self.session().is_some()
    }
}

/// Idle means the registry's own references are the only ones left.
fn slot_is_idle(slot: &Arc<SessionSlot>) -> bool {
    Arc::strong_count(slot) == 1
        && slot
            .session()
            .map(|session| Arc::strong_count(session) == 1)
            .unwrap_or(false)
}

pub struct SessionRegistry {
    factory: Arc<dyn SessionFactory>,
    slots: Arc<DashMap<String, Arc<SessionSlot>>>,
    /// 0 means unbounded
    max_sessions: usize,
    epoch: Instant,
}

impl SessionRegistry {
    pub fn new(factory: Arc<dyn SessionFactory>, max_sessions: usize) -> Self {
        Self {
            factory,
            slots: Arc::new(DashMap::new()),
            max_sessions,
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn slot(&self, model_name: &str) -> Arc<SessionSlot> {
        if let Some(slot) = self.slots.get(model_name) {
            return slot.value().clone();
        }
        self.slots
            .entry(model_name.to_string())
            .or_insert_with(|| Arc::new(SessionSlot::new()))
            .value()
            .clone()
    }

    /// Return the session for `model_name`, constructing it on first use.
    ///
    /// Construction runs in its own task: a caller that is cancelled
    /// mid-load does not abort the load, and the next caller picks up the
    /// finished session instead of starting a second one.
    pub async fn get_or_create(&self, model_name: &str) -> Result<Arc<dyn BackgroundSession>, ServiceError> {
        let slot = self.slot(model_name);
        slot.touch(self.now_ms());

        if let Some(attempt) = slot.cell.get() {
            return attempt.clone();
        }

        let factory = self.factory.clone();
        let slots = self.slots.clone();
        let name = model_name.to_string();
        let loader = slot.clone();
        let handle = tokio::spawn(async move {
            loader
                .cell
                .get_or_init(|| async {
                    let attempt = construct(factory, name.clone()).await;
                    if attempt.is_err() {
                        // unpublished failure: waiters on this slot share it,
                        // later lookups get a fresh slot
                        slots.remove_if(&name, |_, current| Arc::ptr_eq(current, &loader));
                    }
                    attempt
                })
                .await
                .clone()
        });
        drop(slot);

        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(ServiceError::model_load(model_name, format!("construction task failed: {}", e))),
        };

        match result {
            Ok(session) => {
                self.evict_over_capacity(model_name);
                metrics::set_loaded_sessions(self.loaded_count());
                Ok(session)
            }
            Err(e) => {
                // a construction task that died leaves an empty slot behind
                self.slots
                    .remove_if(model_name, |_, slot| !slot.cell.initialized() && Arc::strong_count(slot) == 1);
                Err(e)
            }
        }
    }

    /// Construct `model_name` in the background. Failure is logged, never
    /// propagated.
    pub fn warmup(self: &Arc<Self>, model_name: &str) -> JoinHandle<()> {
        let registry = self.clone();
        let name = model_name.to_string();
        tokio::spawn(async move {
            let started = Instant::now();
            match registry.get_or_create(&name).await {
                Ok(session) => info!(
                    "Warmup finished for {} on {} backend in {:.2}s",
                    name,
                    session.backend().as_str(),
                    started.elapsed().as_secs_f64()
                ),
                Err(e) => warn!("Warmup failed for {}: {}", name, e),
            }
        })
    }

    /// Names with a constructed session, sorted.
    pub fn loaded_models(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .slots
            .iter()
            .filter(|entry| entry.value().is_loaded())
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn backends(&self) -> BTreeMap<String, ExecutionBackend> {
        self.slots
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .session()
                    .map(|session| (entry.key().clone(), session.backend()))
            })
            .collect()
    }

    pub fn loaded_count(&self) -> usize {
        self.slots.iter().filter(|entry| entry.value().is_loaded()).count()
    }

    fn evict_over_capacity(&self, keep: &str) {
        if self.max_sessions == 0 {
            return;
        }

        loop {
            let mut loaded: Vec<(String, u64)> = self
                .slots
                .iter()
                .filter(|entry| entry.value().is_loaded())
                .map(|entry| (entry.key().clone(), entry.value().last_used()))
                .collect();
            if loaded.len() <= self.max_sessions {
                return;
            }

            loaded.retain(|(name, _)| name != keep);
            loaded.sort_by_key(|(_, last_used)| *last_used);

            let evicted = loaded
                .iter()
                .find_map(|(name, _)| self.slots.remove_if(name, |_, slot| slot_is_idle(slot)));

            match evicted {
                Some((name, _)) => {
                    info!("Evicted idle session {} (capacity {})", name, self.max_sessions);
                    metrics::inc_session_eviction(&name);
                }
                None => {
                    warn!(
                        "Session cache over capacity ({} > {}) but every other session is in use",
                        loaded.len() + 1,
                        self.max_sessions
                    );
                    return;
                }
            }
        }
    }
}

async fn construct(
    factory: Arc<dyn SessionFactory>,
    model_name: String,
) -> Result<Arc<dyn BackgroundSession>, ServiceError> {
    info!("Constructing session for {}", model_name);
    let started = Instant::now();
    let name = model_name.clone();

    let created = tokio::task::spawn_blocking(move || factory.create(&name))
        .await
        .map_err(|e| ServiceError::model_load(&model_name, format!("construction task aborted: {}", e)))?;

    match created {
        Ok(session) => {
            let backend = session.backend();
            info!(
                "Session created for {} on {} backend in {:.2}s",
                model_name,
                backend.as_str(),
                started.elapsed().as_secs_f64()
            );
            metrics::inc_session_construction(&model_name, backend.as_str());
            Ok(session)
        }
        Err(e) => {
            error!(
                "Session construction for {} failed after {:.2}s: {:#}",
                model_name,
                started.elapsed().as_secs_f64(),
                e
            );
            Err(ServiceError::model_load(&model_name, format!("{:#}", e)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::CountingFactory;
    use std::time::Duration;

    fn registry_with(factory: Arc<CountingFactory>, max_sessions: usize) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(factory, max_sessions))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_requests_construct_once() {
        let factory = Arc::new(CountingFactory::with_delay(Duration::from_millis(100)));
        let registry = registry_with(factory.clone(), 0);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get_or_create("isnet-general-use").await.map(|_| ()) })
            })
            .collect();
        for result in futures::future::join_all(tasks).await {
            assert!(result.unwrap().is_ok());
        }

        assert_eq!(factory.constructions("isnet-general-use"), 1);
        assert_eq!(registry.loaded_models(), vec!["isnet-general-use".to_string()]);
    }

    #[tokio::test]
    async fn test_repeated_requests_reuse_session() {
        let factory = Arc::new(CountingFactory::new());
        let registry = registry_with(factory.clone(), 0);

        let a = registry.get_or_create("u2net").await.unwrap();
        let b = registry.get_or_create("u2net").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.total(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_different_models_construct_in_parallel() {
        let factory = Arc::new(CountingFactory::with_delay(Duration::from_millis(300)));
        let registry = registry_with(factory.clone(), 0);

        let started = Instant::now();
        let (a, b) = tokio::join!(registry.get_or_create("u2net"), registry.get_or_create("u2netp"));
        assert!(a.is_ok() && b.is_ok());
        // serialized construction would take at least 600ms
        assert!(started.elapsed() < Duration::from_millis(550));
        assert_eq!(factory.total(), 2);
    }

    #[tokio::test]
    async fn test_failed_construction_does_not_poison() {
        let factory = Arc::new(CountingFactory::new());
        let registry = registry_with(factory.clone(), 0);

        let err = registry.get_or_create("nonexistent-model").await.err().unwrap();
        assert!(matches!(err, ServiceError::ModelLoad { .. }));
        assert!(registry.loaded_models().is_empty());
        assert_eq!(registry.slots.len(), 0);

        assert!(registry.get_or_create("u2net").await.is_ok());
        assert_eq!(registry.loaded_models(), vec!["u2net".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_failed_attempt() {
        let mut factory = CountingFactory::with_delay(Duration::from_millis(100));
        factory.broken.push("u2net".to_string());
        let factory = Arc::new(factory);
        let registry = registry_with(factory.clone(), 0);

        let started = Instant::now();
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get_or_create("u2net").await.map(|_| ()) })
            })
            .collect();
        for result in futures::future::join_all(tasks).await {
            assert!(matches!(result.unwrap(), Err(ServiceError::ModelLoad { .. })));
        }

        assert_eq!(factory.attempts(), 1);
        // eight serial attempts would take 800ms
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(registry.slots.len(), 0);

        // a later request starts a new attempt
        assert!(registry.get_or_create("u2net").await.is_err());
        assert_eq!(factory.attempts(), 2);
    }

    #[tokio::test]
    async fn test_warmup_failure_is_swallowed() {
        let factory = Arc::new(CountingFactory::new());
        let registry = registry_with(factory, 0);

        registry.warmup("nonexistent-model").await.unwrap();
        assert!(registry.loaded_models().is_empty());

        registry.warmup("isnet-general-use").await.unwrap();
        assert_eq!(registry.loaded_models(), vec!["isnet-general-use".to_string()]);
    }

    #[tokio::test]
    async fn test_backends_reports_capability() {
        let registry = registry_with(Arc::new(CountingFactory::new()), 0);
        registry.get_or_create("u2net").await.unwrap();
        let backends = registry.backends();
        assert_eq!(backends.get("u2net"), Some(&ExecutionBackend::Fallback));
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_used_idle_session() {
        let factory = Arc::new(CountingFactory::new());
        let registry = registry_with(factory.clone(), 2);

        drop(registry.get_or_create("u2net").await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(registry.get_or_create("u2netp").await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(registry.get_or_create("silueta").await.unwrap());

        assert_eq!(registry.loaded_models(), vec!["silueta".to_string(), "u2netp".to_string()]);
    }

    #[tokio::test]
    async fn test_capacity_never_evicts_busy_session() {
        let factory = Arc::new(CountingFactory::new());
        let registry = registry_with(factory.clone(), 1);

        let held = registry.get_or_create("u2net").await.unwrap();
        let _second = registry.get_or_create("u2netp").await.unwrap();

        // both in use, so the cache stays over capacity
        assert_eq!(registry.loaded_count(), 2);
        drop(held);

        registry.get_or_create("silueta").await.unwrap();
        assert!(!registry.loaded_models().contains(&"u2net".to_string()));
        assert_eq!(factory.constructions("u2net"), 1);
    }
}
