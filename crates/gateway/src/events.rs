//! Registry change feed
//!
//! Whoever mutates the registry publishes a [`RegistryChange`]; the
//! invalidation listener turns each change into pool and cache invalidation.

use std::sync::Arc;

use metagate_shared::NamespaceId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::middleware::ToolStatusFilter;
use crate::overrides::ToolOverrides;
use crate::pool::NamespaceServerPool;
use crate::rate_limit::RateLimitRules;

const DEFAULT_FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryChange {
    NamespaceCreated { namespace_uuid: NamespaceId },
    NamespaceDeleted { namespace_uuid: NamespaceId },
    /// Membership or member server configuration changed
    NamespaceServersChanged { namespace_uuids: Vec<NamespaceId> },
    OverridesChanged { namespace_uuid: NamespaceId },
    ToolStatusChanged { namespace_uuid: NamespaceId },
    RateLimitRulesChanged,
}

pub struct ChangeFeed {
    tx: broadcast::Sender<RegistryChange>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns the number of subscribers that will see the change
    pub fn publish(&self, change: RegistryChange) -> usize {
        tracing::debug!(?change, "Registry change published");
        self.tx.send(change).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryChange> {
        self.tx.subscribe()
    }
}

/// Everything a registry change can invalidate
#[derive(Clone)]
pub struct InvalidationTargets {
    pub pool: Arc<NamespaceServerPool>,
    pub overrides: Arc<ToolOverrides>,
    pub tool_status: Arc<ToolStatusFilter>,
    pub rate_limit_rules: Arc<RateLimitRules>,
}

impl InvalidationTargets {
    pub async fn apply(&self, change: &RegistryChange) {
        match change {
            RegistryChange::NamespaceCreated { namespace_uuid } => {
                self.pool.ensure_idle_for_new_namespace(*namespace_uuid).await;
            }
            RegistryChange::NamespaceDeleted { namespace_uuid } => {
                self.pool.cleanup_idle(*namespace_uuid).await;
                self.overrides.clear_cache(Some(*namespace_uuid));
                self.tool_status.clear(Some(*namespace_uuid));
            }
            RegistryChange::NamespaceServersChanged { namespace_uuids } => {
                for namespace_uuid in namespace_uuids {
                    self.tool_status.clear(Some(*namespace_uuid));
                }
                self.pool.invalidate_idle_many(namespace_uuids).await;
                self.pool.invalidate_open_api(namespace_uuids).await;
            }
            RegistryChange::OverridesChanged { namespace_uuid } => {
                self.overrides.clear_cache(Some(*namespace_uuid));
                self.pool.invalidate_idle(*namespace_uuid).await;
                self.pool.invalidate_open_api(&[*namespace_uuid]).await;
            }
            RegistryChange::ToolStatusChanged { namespace_uuid } => {
                self.tool_status.clear(Some(*namespace_uuid));
            }
            RegistryChange::RateLimitRulesChanged => {
                self.rate_limit_rules.invalidate().await;
            }
        }
    }
}

/// Handle to the running invalidation listener
pub struct ChangeListener {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ChangeListener {
    pub fn spawn(targets: InvalidationTargets, mut changes: broadcast::Receiver<RegistryChange>) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    _ = token.cancelled() => break,
                    received = changes.recv() => match received {
                        Ok(change) => change,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // Missed changes could leave anything stale
                            tracing::warn!(skipped, "Change listener lagged, clearing caches");
                            targets.overrides.clear_cache(None);
                            targets.tool_status.clear(None);
                            targets.rate_limit_rules.invalidate().await;
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                targets.apply(&change).await;
            }
            tracing::debug!("Change listener stopped");
        });

        Self { cancel, handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Change listener task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::test_support::*;
    use metagate_shared::{InMemoryStore, ToolOverride};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Fixture {
        feed: ChangeFeed,
        targets: InvalidationTargets,
        factory: Arc<FakeFactory>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let factory = Arc::new(FakeFactory::default());
        let targets = InvalidationTargets {
            pool: NamespaceServerPool::new(factory.clone(), None),
            overrides: Arc::new(ToolOverrides::new(store.clone(), Duration::from_secs(1))),
            tool_status: Arc::new(ToolStatusFilter::new(store.clone())),
            rate_limit_rules: Arc::new(RateLimitRules::new(store)),
        };
        Fixture {
            feed: ChangeFeed::default(),
            targets,
            factory,
        }
    }

    fn cached_override(ns: NamespaceId) -> ToolOverride {
        ToolOverride {
            namespace_uuid: ns,
            server_name: "github".to_string(),
            tool_name: "create_issue".to_string(),
            override_name: Some("new_issue".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let feed = ChangeFeed::default();
        assert_eq!(feed.publish(RegistryChange::RateLimitRulesChanged), 0);
    }

    #[tokio::test]
    async fn test_namespace_lifecycle() {
        let f = fixture();
        let ns = NamespaceId::new();

        f.targets
            .apply(&RegistryChange::NamespaceCreated { namespace_uuid: ns })
            .await;
        assert_eq!(f.targets.pool.status().await.idle_namespaces, vec![ns]);

        f.targets
            .apply(&RegistryChange::NamespaceServersChanged {
                namespace_uuids: vec![ns],
            })
            .await;
        settle(&f.targets.pool).await;
        let created = f.factory.created();
        assert_eq!(created.len(), 2);
        assert_eq!(created[0].cleanups.load(Ordering::SeqCst), 1);

        f.targets
            .apply(&RegistryChange::NamespaceDeleted { namespace_uuid: ns })
            .await;
        settle(&f.targets.pool).await;
        assert_eq!(f.targets.pool.status().await.idle, 0);
    }

    #[tokio::test]
    async fn test_override_change_clears_only_that_namespace() {
        let f = fixture();
        let (ns_a, ns_b) = (NamespaceId::new(), NamespaceId::new());
        let cache = f.targets.overrides.cache();
        cache.set(cached_override(ns_a), true);
        cache.set(cached_override(ns_b), true);

        f.targets
            .apply(&RegistryChange::OverridesChanged { namespace_uuid: ns_a })
            .await;

        assert!(cache.get(ns_a, "github", "create_issue").is_none());
        assert!(cache.get(ns_b, "github", "create_issue").is_some());
    }

    #[tokio::test]
    async fn test_listener_applies_published_changes() {
        let f = fixture();
        let ns = NamespaceId::new();
        f.targets.overrides.cache().set(cached_override(ns), true);

        let listener = ChangeListener::spawn(f.targets.clone(), f.feed.subscribe());
        assert_eq!(f.feed.publish(RegistryChange::NamespaceDeleted { namespace_uuid: ns }), 1);

        for _ in 0..50 {
            if f.targets.overrides.cache().get(ns, "github", "create_issue").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(f.targets.overrides.cache().get(ns, "github", "create_issue").is_none());

        assert!(listener.is_running());
        listener.stop().await;
    }
}
