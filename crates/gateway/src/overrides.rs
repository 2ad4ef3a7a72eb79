//! Tool override cache and application
//!
//! Overrides rename, retitle, redescribe or re-annotate a downstream tool
//! inside one namespace. The list path applies them (and records the reverse
//! mapping); the call path maps an overridden name back to the original.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use metagate_shared::{NamespaceId, ToolOverride, ToolOverrideRepository};
use serde::Serialize;

use crate::error::GatewayResult;
use crate::mcp::tool_name::{parse_tool_name, prefix_tool_name, TOOL_SEPARATOR};
use crate::mcp::types::Tool;

/// Default TTL for forward entries not populated by a full list refresh
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(1);

/// Legacy annotation key superseded by the top-level title
const LEGACY_TITLE_ANNOTATION: &str = "title";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ForwardKey {
    namespace_uuid: NamespaceId,
    server_name: String,
    tool_name: String,
}

#[derive(Clone)]
struct CacheEntry {
    rule: ToolOverride,
    /// `None` never expires
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() > at)
    }
}

/// Cache statistics
#[derive(Default, Debug, Clone, Serialize)]
pub struct OverrideCacheStats {
    pub forward_entries: usize,
    pub persistent_entries: usize,
    pub expired_entries: usize,
    pub reverse_entries: usize,
}

/// Thread-safe forward and reverse override cache
pub struct OverrideCache {
    forward: RwLock<HashMap<ForwardKey, CacheEntry>>,
    /// (namespace, override full name) -> original full name
    reverse: RwLock<HashMap<(NamespaceId, String), String>>,
    ttl: Duration,
}

impl Default for OverrideCache {
    fn default() -> Self {
        Self::new()
    }
}

impl OverrideCache {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            forward: RwLock::new(HashMap::new()),
            reverse: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    fn key(namespace_uuid: NamespaceId, server_name: &str, tool_name: &str) -> ForwardKey {
        ForwardKey {
            namespace_uuid,
            server_name: server_name.to_string(),
            tool_name: tool_name.to_string(),
        }
    }

    pub fn get(
        &self,
        namespace_uuid: NamespaceId,
        server_name: &str,
        tool_name: &str,
    ) -> Option<ToolOverride> {
        let forward = self.forward.read().unwrap_or_else(PoisonError::into_inner);
        let entry = forward.get(&Self::key(namespace_uuid, server_name, tool_name))?;
        (!entry.is_expired()).then(|| entry.rule.clone())
    }

    pub fn set(&self, rule: ToolOverride, persistent: bool) {
        let key = Self::key(rule.namespace_uuid, &rule.server_name, &rule.tool_name);
        let expires_at = (!persistent).then(|| Instant::now() + self.ttl);
        let mut forward = self.forward.write().unwrap_or_else(PoisonError::into_inner);
        forward.insert(key, CacheEntry { rule, expires_at });
    }

    pub fn set_reverse(&self, namespace_uuid: NamespaceId, override_name: &str, original_name: &str) {
        let mut reverse = self.reverse.write().unwrap_or_else(PoisonError::into_inner);
        reverse.insert(
            (namespace_uuid, override_name.to_string()),
            original_name.to_string(),
        );
    }

    pub fn get_original_name(&self, namespace_uuid: NamespaceId, override_name: &str) -> Option<String> {
        let reverse = self.reverse.read().unwrap_or_else(PoisonError::into_inner);
        reverse
            .get(&(namespace_uuid, override_name.to_string()))
            .cloned()
    }

    /// Evict one namespace's entries, or everything
    pub fn clear(&self, namespace_uuid: Option<NamespaceId>) {
        let mut forward = self.forward.write().unwrap_or_else(PoisonError::into_inner);
        let mut reverse = self.reverse.write().unwrap_or_else(PoisonError::into_inner);
        match namespace_uuid {
            Some(ns) => {
                forward.retain(|key, _| key.namespace_uuid != ns);
                reverse.retain(|(key_ns, _), _| *key_ns != ns);
            }
            None => {
                forward.clear();
                reverse.clear();
            }
        }
    }

    /// Clear expired entries
    pub fn cleanup(&self) {
        let mut forward = self.forward.write().unwrap_or_else(PoisonError::into_inner);
        forward.retain(|_, entry| !entry.is_expired());
    }

    pub fn stats(&self) -> OverrideCacheStats {
        let forward = self.forward.read().unwrap_or_else(PoisonError::into_inner);
        let reverse = self.reverse.read().unwrap_or_else(PoisonError::into_inner);
        OverrideCacheStats {
            forward_entries: forward.len(),
            persistent_entries: forward.values().filter(|e| e.expires_at.is_none()).count(),
            expired_entries: forward.values().filter(|e| e.is_expired()).count(),
            reverse_entries: reverse.len(),
        }
    }
}

/// Apply one override to a tool already named `{server}__{tool}`
fn apply_override(mut tool: Tool, server_part: &str, rule: &ToolOverride) -> Tool {
    if let Some(name) = rule.effective_name() {
        tool.name = format!("{}{}{}", server_part, TOOL_SEPARATOR, name);
    }

    // Empty string is a deliberate description
    if let Some(description) = &rule.override_description {
        tool.description = Some(description.clone());
    }

    match &rule.override_title {
        Some(Some(title)) => tool.title = Some(title.clone()),
        Some(None) => tool.title = None,
        None => {}
    }

    if let Some(patch) = &rule.override_annotations {
        let mut annotations = tool.annotations.take().unwrap_or_default();
        annotations.remove(LEGACY_TITLE_ANNOTATION);
        for (key, value) in patch {
            if key != LEGACY_TITLE_ANNOTATION {
                annotations.insert(key.clone(), value.clone());
            }
        }
        tool.annotations = (!annotations.is_empty()).then_some(annotations);
    }

    tool
}

/// Override lookups backed by the repository
pub struct ToolOverrides {
    cache: OverrideCache,
    repository: Arc<dyn ToolOverrideRepository>,
}

impl ToolOverrides {
    pub fn new(repository: Arc<dyn ToolOverrideRepository>, ttl: Duration) -> Self {
        Self {
            cache: OverrideCache::with_ttl(ttl),
            repository,
        }
    }

    pub fn cache(&self) -> &OverrideCache {
        &self.cache
    }

    /// Cached lookup, falling back to the repository
    pub async fn get_override(
        &self,
        namespace_uuid: NamespaceId,
        server_name: &str,
        tool_name: &str,
        persistent: bool,
    ) -> GatewayResult<Option<ToolOverride>> {
        if let Some(rule) = self.cache.get(namespace_uuid, server_name, tool_name) {
            return Ok(Some(rule));
        }

        let rule = self
            .repository
            .find_override(namespace_uuid, server_name, tool_name)
            .await?;
        if let Some(rule) = &rule {
            self.cache.set(rule.clone(), persistent);
        }
        Ok(rule)
    }

    /// Apply namespace overrides to a tool list.
    ///
    /// Lookups run concurrently and the output keeps the input order. Tools
    /// whose names don't parse, or whose lookup fails, pass through unchanged.
    pub async fn apply_overrides(&self, tools: Vec<Tool>, namespace_uuid: NamespaceId) -> Vec<Tool> {
        futures::future::join_all(tools.into_iter().map(|tool| async move {
            let Some(parsed) = parse_tool_name(&tool.name) else {
                return tool;
            };

            match self
                .get_override(namespace_uuid, &parsed.server_name, &parsed.tool_name, true)
                .await
            {
                Ok(Some(rule)) => {
                    let original_name = tool.name.clone();
                    let updated = apply_override(tool, &parsed.server_name, &rule);
                    if updated.name != original_name {
                        self.cache
                            .set_reverse(namespace_uuid, &updated.name, &original_name);
                    }
                    updated
                }
                Ok(None) => tool,
                Err(e) => {
                    tracing::warn!(
                        namespace_uuid = %namespace_uuid,
                        tool = %tool.name,
                        error = %e,
                        "Override lookup failed, leaving tool unchanged"
                    );
                    tool
                }
            }
        }))
        .await
    }

    /// Map a possibly-overridden name back to the downstream name.
    ///
    /// Unknown names, store misses and store errors all return the input.
    pub async fn map_override_name_to_original(
        &self,
        name: &str,
        namespace_uuid: NamespaceId,
    ) -> String {
        let Some(parsed) = parse_tool_name(name) else {
            return name.to_string();
        };

        if let Some(original) = self.cache.get_original_name(namespace_uuid, name) {
            return original;
        }

        match self
            .repository
            .find_by_override_name(namespace_uuid, &parsed.server_name, &parsed.tool_name)
            .await
        {
            Ok(Some(rule)) => {
                let original = prefix_tool_name(&parsed.server_name, &rule.tool_name);
                self.cache.set_reverse(namespace_uuid, name, &original);
                self.cache.set(rule, false);
                original
            }
            Ok(None) => name.to_string(),
            Err(e) => {
                tracing::warn!(
                    namespace_uuid = %namespace_uuid,
                    tool = %name,
                    error = %e,
                    "Override resolution failed, using name unchanged"
                );
                name.to_string()
            }
        }
    }

    /// Drop downstream tools whose (unprefixed) names are override names
    /// configured for that server. They come from a gateway exposing our own
    /// overrides and must not be synced back into the catalog.
    pub async fn filter_out_override_tools(
        &self,
        tools: Vec<Tool>,
        namespace_uuid: NamespaceId,
        server_name: &str,
    ) -> Vec<Tool> {
        let rules = match self
            .repository
            .list_for_server(namespace_uuid, server_name)
            .await
        {
            Ok(rules) => rules,
            Err(e) => {
                tracing::warn!(server = %server_name, error = %e, "Override listing failed");
                return tools;
            }
        };

        let override_names: Vec<&str> = rules.iter().filter_map(|r| r.effective_name()).collect();
        if override_names.is_empty() {
            return tools;
        }

        tools
            .into_iter()
            .filter(|t| !override_names.contains(&t.name.as_str()))
            .collect()
    }

    pub fn clear_cache(&self, namespace_uuid: Option<NamespaceId>) {
        self.cache.clear(namespace_uuid);
        tracing::debug!(namespace_uuid = ?namespace_uuid, "Override cache cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use metagate_shared::{InMemoryStore, RepoResult, RepositoryError};
    use serde_json::json;
    use std::thread::sleep;

    fn rule(ns: NamespaceId, server: &str, tool: &str) -> ToolOverride {
        ToolOverride {
            namespace_uuid: ns,
            server_name: server.to_string(),
            tool_name: tool.to_string(),
            ..Default::default()
        }
    }

    fn tool(name: &str) -> Tool {
        Tool::new(name, "original", json!({"type": "object"}))
    }

    #[test]
    fn test_cache_expiration() {
        let cache = OverrideCache::with_ttl(Duration::from_millis(50));
        let ns = NamespaceId::new();

        cache.set(rule(ns, "github", "create_issue"), false);
        cache.set(rule(ns, "github", "close_issue"), true);
        assert!(cache.get(ns, "github", "create_issue").is_some());

        sleep(Duration::from_millis(60));
        assert!(cache.get(ns, "github", "create_issue").is_none());
        assert!(cache.get(ns, "github", "close_issue").is_some());

        cache.cleanup();
        assert_eq!(cache.stats().forward_entries, 1);
    }

    #[test]
    fn test_clear_only_touches_one_namespace() {
        let cache = OverrideCache::new();
        let ns_a = NamespaceId::new();
        let ns_b = NamespaceId::new();

        cache.set(rule(ns_a, "github", "create_issue"), true);
        cache.set(rule(ns_b, "github", "create_issue"), true);
        cache.set_reverse(ns_a, "github__new", "github__create_issue");
        cache.set_reverse(ns_b, "github__new", "github__create_issue");

        cache.clear(Some(ns_a));

        assert!(cache.get(ns_a, "github", "create_issue").is_none());
        assert!(cache.get_original_name(ns_a, "github__new").is_none());
        assert!(cache.get(ns_b, "github", "create_issue").is_some());
        assert_eq!(
            cache.get_original_name(ns_b, "github__new").as_deref(),
            Some("github__create_issue")
        );
    }

    #[test]
    fn test_apply_override_fields() {
        let ns = NamespaceId::new();
        let mut original = tool("github__create_issue");
        original.title = Some("Create".to_string());
        original.annotations = Some(
            json!({"title": "legacy", "readOnlyHint": false})
                .as_object()
                .cloned()
                .unwrap(),
        );

        let mut r = rule(ns, "github", "create_issue");
        r.override_name = Some("open_ticket".to_string());
        r.override_description = Some(String::new());
        r.override_title = Some(None);
        r.override_annotations = json!({"readOnlyHint": true}).as_object().cloned();

        let updated = apply_override(original, "github", &r);
        assert_eq!(updated.name, "github__open_ticket");
        assert_eq!(updated.description.as_deref(), Some(""));
        assert_eq!(updated.title, None);
        let annotations = updated.annotations.unwrap();
        assert!(!annotations.contains_key("title"));
        assert_eq!(annotations["readOnlyHint"], true);
    }

    #[tokio::test]
    async fn test_apply_overrides_is_idempotent() {
        let store = Arc::new(InMemoryStore::new());
        let ns = NamespaceId::new();
        let mut r = rule(ns, "github", "create_issue");
        r.override_name = Some("open_ticket".to_string());
        r.override_annotations = json!({"destructiveHint": false}).as_object().cloned();
        store.insert_override(r).await;

        let overrides = ToolOverrides::new(store, DEFAULT_CACHE_TTL);
        let tools = vec![tool("github__create_issue"), tool("github__list_repos"), tool("plain")];

        let once = overrides.apply_overrides(tools, ns).await;
        let twice = overrides.apply_overrides(once.clone(), ns).await;

        assert_eq!(once, twice);
        assert_eq!(once[0].name, "github__open_ticket");
        assert_eq!(once[1].name, "github__list_repos");
        assert_eq!(once[2].name, "plain");
        assert_eq!(once[0].annotations.as_ref().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_blank_override_name_keeps_original() {
        let store = Arc::new(InMemoryStore::new());
        let ns = NamespaceId::new();
        let mut r = rule(ns, "github", "create_issue");
        r.override_name = Some("".to_string());
        r.override_description = Some("better".to_string());
        store.insert_override(r).await;

        let overrides = ToolOverrides::new(store, DEFAULT_CACHE_TTL);
        let result = overrides
            .apply_overrides(vec![tool("github__create_issue")], ns)
            .await;
        assert_eq!(result[0].name, "github__create_issue");
        assert_eq!(result[0].description.as_deref(), Some("better"));
    }

    #[tokio::test]
    async fn test_resolution_uses_cache_then_store() {
        let store = Arc::new(InMemoryStore::new());
        let ns = NamespaceId::new();
        let mut r = rule(ns, "github", "create_issue");
        r.override_name = Some("open_ticket".to_string());
        store.insert_override(r).await;

        let overrides = ToolOverrides::new(store.clone(), DEFAULT_CACHE_TTL);

        // Cold cache goes to the store
        assert_eq!(
            overrides
                .map_override_name_to_original("github__open_ticket", ns)
                .await,
            "github__create_issue"
        );

        // Removing the row does not matter once the reverse entry exists
        store.clear_overrides(ns).await;
        assert_eq!(
            overrides
                .map_override_name_to_original("github__open_ticket", ns)
                .await,
            "github__create_issue"
        );

        // Unknown names pass through
        assert_eq!(
            overrides
                .map_override_name_to_original("github__list_repos", ns)
                .await,
            "github__list_repos"
        );
    }

    struct FailingRepository;

    #[async_trait]
    impl ToolOverrideRepository for FailingRepository {
        async fn find_override(
            &self,
            _ns: NamespaceId,
            _server: &str,
            _tool: &str,
        ) -> RepoResult<Option<ToolOverride>> {
            Err(RepositoryError::Unavailable("down".to_string()))
        }

        async fn find_by_override_name(
            &self,
            _ns: NamespaceId,
            _server: &str,
            _name: &str,
        ) -> RepoResult<Option<ToolOverride>> {
            Err(RepositoryError::Unavailable("down".to_string()))
        }

        async fn list_for_server(
            &self,
            _ns: NamespaceId,
            _server: &str,
        ) -> RepoResult<Vec<ToolOverride>> {
            Err(RepositoryError::Unavailable("down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let overrides = ToolOverrides::new(Arc::new(FailingRepository), DEFAULT_CACHE_TTL);
        let ns = NamespaceId::new();

        assert_eq!(
            overrides
                .map_override_name_to_original("github__open_ticket", ns)
                .await,
            "github__open_ticket"
        );

        let tools = overrides
            .apply_overrides(vec![tool("github__create_issue")], ns)
            .await;
        assert_eq!(tools[0].name, "github__create_issue");
        assert_eq!(tools[0].description.as_deref(), Some("original"));
    }

    #[tokio::test]
    async fn test_filter_out_override_tools() {
        let store = Arc::new(InMemoryStore::new());
        let ns = NamespaceId::new();
        let mut r = rule(ns, "github", "create_issue");
        r.override_name = Some("open_ticket".to_string());
        store.insert_override(r).await;

        let overrides = ToolOverrides::new(store, DEFAULT_CACHE_TTL);
        let kept = overrides
            .filter_out_override_tools(vec![tool("create_issue"), tool("open_ticket")], ns, "github")
            .await;
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "create_issue");
    }
}
