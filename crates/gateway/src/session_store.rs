//! TTL-bounded keyed store of live sessions
//!
//! Generic over the session value. Entries carry their creation time and
//! expire once older than the configured lifetime; a `None` lifetime keeps
//! them forever. Persistent entries never expire.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayResult;

/// Async cleanup invoked for each expired entry after it is removed
pub type CleanupFn<T> = Arc<dyn Fn(String, T) -> BoxFuture<'static, GatewayResult<()>> + Send + Sync>;

struct SessionEntry<T> {
    value: T,
    created_at: Instant,
    persistent: bool,
}

struct SweepTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Thread-safe session store
pub struct SessionStore<T> {
    label: &'static str,
    entries: RwLock<HashMap<String, SessionEntry<T>>>,
    lifetime: RwLock<Option<Duration>>,
    sweep: Mutex<Option<SweepTask>>,
}

impl<T: Clone + Send + Sync + 'static> SessionStore<T> {
    pub fn new(label: &'static str, lifetime: Option<Duration>) -> Self {
        Self {
            label,
            entries: RwLock::new(HashMap::new()),
            lifetime: RwLock::new(lifetime),
            sweep: Mutex::new(None),
        }
    }

    /// Insert or replace a session, resetting its age
    pub fn add(&self, id: &str, value: T) {
        self.insert(id, value, false);
    }

    /// Insert a session that never expires
    pub fn add_persistent(&self, id: &str, value: T) {
        self.insert(id, value, true);
    }

    fn insert(&self, id: &str, value: T, persistent: bool) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            id.to_string(),
            SessionEntry {
                value,
                created_at: Instant::now(),
                persistent,
            },
        );
    }

    pub fn remove(&self, id: &str) -> Option<T> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(id).map(|e| e.value)
    }

    pub fn get(&self, id: &str) -> Option<T> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(id).map(|e| e.value.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.keys().cloned().collect()
    }

    pub fn all(&self) -> Vec<(String, T)> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .map(|(id, e)| (id.clone(), e.value.clone()))
            .collect()
    }

    /// Remove every entry, returning them
    pub fn drain(&self) -> Vec<(String, T)> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.drain().map(|(id, e)| (id, e.value)).collect()
    }

    pub fn count(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.len()
    }

    pub fn age(&self, id: &str) -> Option<Duration> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(id).map(|e| e.created_at.elapsed())
    }

    pub fn lifetime(&self) -> Option<Duration> {
        *self.lifetime.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change the lifetime; applies to existing entries on the next check
    pub fn set_lifetime(&self, lifetime: Option<Duration>) {
        *self.lifetime.write().unwrap_or_else(PoisonError::into_inner) = lifetime;
    }

    pub fn is_expired(&self, id: &str) -> bool {
        let Some(lifetime) = self.lifetime() else {
            return false;
        };
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(id)
            .map(|e| !e.persistent && e.created_at.elapsed() > lifetime)
            .unwrap_or(false)
    }

    /// Remove all expired entries and run `cleanup` for each of them.
    ///
    /// Cleanups run concurrently; one failing entry never stops the others.
    /// Returns the number of expired entries.
    pub async fn cleanup_expired(&self, cleanup: &CleanupFn<T>) -> usize {
        let Some(lifetime) = self.lifetime() else {
            return 0;
        };

        let expired: Vec<(String, T)> = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, e)| !e.persistent && e.created_at.elapsed() > lifetime)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|e| (id, e.value)))
                .collect()
        };

        if expired.is_empty() {
            return 0;
        }

        let count = expired.len();
        let label = self.label;
        let results = futures::future::join_all(
            expired
                .into_iter()
                .map(|(id, value)| {
                    let fut = cleanup(id.clone(), value);
                    async move { (id, fut.await) }
                }),
        )
        .await;

        for (id, result) in results {
            if let Err(e) = result {
                tracing::error!(store = label, session_id = %id, error = %e, "Session cleanup failed");
            }
        }

        tracing::info!(store = label, count, "Expired sessions cleaned up");
        count
    }

    /// Start the periodic sweep. Calling it again replaces the running sweep.
    pub fn start_cleanup_timer(self: &Arc<Self>, interval: Duration, cleanup: CleanupFn<T>) {
        self.stop_cleanup_timer();

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let store: Weak<Self> = Arc::downgrade(self);
        let label = self.label;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(store) = store.upgrade() else { break };
                        store.cleanup_expired(&cleanup).await;
                    }
                }
            }
            tracing::debug!(store = label, "Session sweep stopped");
        });

        let mut sweep = self.sweep.lock().unwrap_or_else(PoisonError::into_inner);
        *sweep = Some(SweepTask { cancel, handle });
    }

    pub fn stop_cleanup_timer(&self) {
        let task = self
            .sweep
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.cancel.cancel();
            task.handle.abort();
        }
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweep
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_cleanup(counter: Arc<AtomicUsize>) -> CleanupFn<u32> {
        Arc::new(move |id, _value| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if id == "bad" {
                    return Err(GatewayError::Internal("boom".to_string()));
                }
                Ok(())
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_infinite_lifetime_never_expires() {
        let store: SessionStore<u32> = SessionStore::new("test", None);
        store.add("a", 1);
        tokio::time::advance(Duration::from_secs(86_400)).await;

        assert!(!store.is_expired("a"));
        let cleanup = counting_cleanup(Arc::new(AtomicUsize::new(0)));
        assert_eq!(store.cleanup_expired(&cleanup).await, 0);
        assert_eq!(store.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_isolates_failures() {
        let store: SessionStore<u32> = SessionStore::new("test", Some(Duration::from_secs(10)));
        store.add("bad", 1);
        store.add("good", 2);
        store.add_persistent("pinned", 3);

        tokio::time::advance(Duration::from_secs(11)).await;
        store.add("fresh", 4);

        let counter = Arc::new(AtomicUsize::new(0));
        let cleanup = counting_cleanup(counter.clone());
        assert_eq!(store.cleanup_expired(&cleanup).await, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        let mut remaining = store.ids();
        remaining.sort();
        assert_eq!(remaining, vec!["fresh".to_string(), "pinned".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifetime_change_applies_to_existing_entries() {
        let store: SessionStore<u32> = SessionStore::new("test", None);
        store.add("a", 1);
        tokio::time::advance(Duration::from_secs(5)).await;

        store.set_lifetime(Some(Duration::from_secs(1)));
        assert!(store.is_expired("a"));
        assert!(store.age("a").unwrap() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sweep() {
        let store: Arc<SessionStore<u32>> =
            Arc::new(SessionStore::new("test", Some(Duration::from_secs(1))));
        store.add("a", 1);

        let counter = Arc::new(AtomicUsize::new(0));
        store.start_cleanup_timer(Duration::from_secs(5), counting_cleanup(counter.clone()));
        assert!(store.is_sweeping());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(store.count(), 0);

        store.stop_cleanup_timer();
        assert!(!store.is_sweeping());
    }
}
