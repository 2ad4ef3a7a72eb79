//! Inactive tool filtering
//!
//! Tools can be switched off per namespace. Listing hides them and calling
//! them returns an error result. Status lookups are cached briefly per
//! namespace; a failed lookup lets everything through.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use metagate_shared::{NamespaceId, NamespaceRepository};
use tokio::time::Instant;

use super::{
    CallToolHandler, CallToolMiddleware, HandlerContext, ListToolsHandler, ListToolsMiddleware,
    ToolCallRequest,
};
use crate::error::GatewayResult;
use crate::mcp::types::{Tool, ToolCallResult};
use crate::overrides::ToolOverrides;

/// How long a namespace's inactive set is reused
pub const STATUS_CACHE_TTL: Duration = Duration::from_secs(5);

const DEFAULT_INACTIVE_REASON: &str = "Tool is inactive in this namespace";

/// Prefixed tool name -> optional reason
type InactiveSet = Arc<HashMap<String, Option<String>>>;

/// Cached per-namespace tool status lookups, shared by every gateway instance
pub struct ToolStatusFilter {
    repository: Arc<dyn NamespaceRepository>,
    cache: RwLock<HashMap<NamespaceId, (Instant, InactiveSet)>>,
    ttl: Duration,
}

impl ToolStatusFilter {
    pub fn new(repository: Arc<dyn NamespaceRepository>) -> Self {
        Self {
            repository,
            cache: RwLock::new(HashMap::new()),
            ttl: STATUS_CACHE_TTL,
        }
    }

    /// `None` when the store could not be read
    pub async fn inactive_tools(&self, namespace_uuid: NamespaceId) -> Option<InactiveSet> {
        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some((loaded_at, set)) = cache.get(&namespace_uuid) {
                if loaded_at.elapsed() < self.ttl {
                    return Some(set.clone());
                }
            }
        }

        match self.repository.inactive_tools(namespace_uuid).await {
            Ok(statuses) => {
                let set: InactiveSet = Arc::new(
                    statuses
                        .into_iter()
                        .filter(|s| !s.status.is_active())
                        .map(|s| (s.tool_name, s.reason))
                        .collect(),
                );
                let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
                cache.insert(namespace_uuid, (Instant::now(), set.clone()));
                Some(set)
            }
            Err(e) => {
                tracing::warn!(
                    namespace_uuid = %namespace_uuid,
                    error = %e,
                    "Tool status lookup failed, not filtering"
                );
                None
            }
        }
    }

    pub fn clear(&self, namespace_uuid: Option<NamespaceId>) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        match namespace_uuid {
            Some(ns) => {
                cache.remove(&ns);
            }
            None => cache.clear(),
        }
    }
}

pub fn denied_message(tool_name: &str, reason: &str) -> String {
    format!("Access denied to tool \"{}\": {}", tool_name, reason)
}

pub struct FilterMiddleware {
    filter: Arc<ToolStatusFilter>,
    /// Maps client-visible override names back before the status check
    overrides: Option<Arc<ToolOverrides>>,
}

impl FilterMiddleware {
    pub fn new(filter: Arc<ToolStatusFilter>, overrides: Option<Arc<ToolOverrides>>) -> Self {
        Self { filter, overrides }
    }
}

#[async_trait]
impl ListToolsMiddleware for FilterMiddleware {
    async fn handle(&self, ctx: HandlerContext, next: &ListToolsHandler) -> GatewayResult<Vec<Tool>> {
        let namespace_uuid = ctx.namespace_uuid;
        let tools = next(ctx).await?;

        let Some(inactive) = self.filter.inactive_tools(namespace_uuid).await else {
            return Ok(tools);
        };
        if inactive.is_empty() {
            return Ok(tools);
        }

        Ok(tools
            .into_iter()
            .filter(|t| !inactive.contains_key(&t.name))
            .collect())
    }
}

#[async_trait]
impl CallToolMiddleware for FilterMiddleware {
    async fn handle(
        &self,
        request: ToolCallRequest,
        ctx: HandlerContext,
        next: &CallToolHandler,
    ) -> GatewayResult<ToolCallResult> {
        let Some(inactive) = self.filter.inactive_tools(ctx.namespace_uuid).await else {
            return next(request, ctx).await;
        };

        let mut hit = inactive.get(&request.name);
        if hit.is_none() {
            if let Some(overrides) = &self.overrides {
                let original = overrides
                    .map_override_name_to_original(&request.name, ctx.namespace_uuid)
                    .await;
                hit = inactive.get(&original);
            }
        }

        if let Some(reason) = hit {
            tracing::info!(
                session_id = %ctx.session_id,
                tool = %request.name,
                "Call to inactive tool denied"
            );
            let reason = reason.as_deref().unwrap_or(DEFAULT_INACTIVE_REASON);
            return Ok(ToolCallResult::error(denied_message(&request.name, reason)));
        }

        next(request, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{call_layer, compose, list_layer};
    use super::*;
    use metagate_shared::{ActivationStatus, InMemoryStore, NamespaceToolStatus, ToolOverride};
    use serde_json::{json, Value};

    async fn store_with_inactive(ns: NamespaceId) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        store
            .set_tool_status(
                ns,
                NamespaceToolStatus {
                    tool_name: "github__delete_repo".to_string(),
                    status: ActivationStatus::Inactive,
                    reason: Some("Destructive".to_string()),
                },
            )
            .await;
        store
    }

    #[tokio::test]
    async fn test_list_hides_inactive_tools() {
        let ns = NamespaceId::new();
        let store = store_with_inactive(ns).await;
        let middleware = FilterMiddleware::new(Arc::new(ToolStatusFilter::new(store)), None);
        let handler = compose(
            vec![list_layer(Arc::new(middleware))],
            static_list(vec![
                Tool::new("github__delete_repo", "", json!({})),
                Tool::new("github__create_issue", "", json!({})),
            ]),
        );

        let tools = handler(ctx(ns)).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "github__create_issue");
    }

    #[tokio::test]
    async fn test_call_to_inactive_tool_is_denied() {
        let ns = NamespaceId::new();
        let store = store_with_inactive(ns).await;
        let mut rename = ToolOverride {
            namespace_uuid: ns,
            server_name: "github".to_string(),
            tool_name: "delete_repo".to_string(),
            ..Default::default()
        };
        rename.override_name = Some("nuke".to_string());
        store.insert_override(rename).await;

        let overrides = Arc::new(ToolOverrides::new(store.clone(), Duration::from_secs(1)));
        let middleware = FilterMiddleware::new(Arc::new(ToolStatusFilter::new(store)), Some(overrides));
        let (terminal, seen) = recording_terminal();
        let handler = compose(vec![call_layer(Arc::new(middleware))], terminal);

        let result = handler(ToolCallRequest::new("github__delete_repo", Value::Null), ctx(ns))
            .await
            .unwrap();
        assert!(result.is_error);
        assert_eq!(
            result.first_text(),
            Some("Access denied to tool \"github__delete_repo\": Destructive")
        );

        // The override name resolves to the same inactive tool
        let result = handler(ToolCallRequest::new("github__nuke", Value::Null), ctx(ns))
            .await
            .unwrap();
        assert!(result.is_error);

        handler(ToolCallRequest::new("github__create_issue", Value::Null), ctx(ns))
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["github__create_issue".to_string()]);
    }
}
