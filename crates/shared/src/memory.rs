//! In-memory reference store
//!
//! Implements every repository trait over `tokio::sync::RwLock`ed maps.
//! Used by the `metagate` binary (seeded from a JSON snapshot) and by tests.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{RepoResult, RepositoryError};
use crate::repository::*;
use crate::types::*;

#[derive(Default)]
struct NamespaceEntry {
    namespace: Option<Namespace>,
    members: Vec<NamespaceMember>,
    tool_statuses: Vec<NamespaceToolStatus>,
}

/// Thread-safe in-memory registry
#[derive(Default)]
pub struct InMemoryStore {
    servers: RwLock<HashMap<ServerId, McpServer>>,
    namespaces: RwLock<HashMap<NamespaceId, NamespaceEntry>>,
    overrides: RwLock<Vec<ToolOverride>>,
    rules: RwLock<HashMap<RuleId, RateLimitRule>>,
    policies: RwLock<HashMap<PolicyId, Policy>>,
    tools: RwLock<HashMap<ServerId, Vec<StoredTool>>>,
    logs: RwLock<Vec<ToolCallLog>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a registry snapshot
    pub async fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        let store = Self::new();
        for server in snapshot.servers {
            store.insert_server(server).await;
        }
        for record in snapshot.namespaces {
            let uuid = record.namespace.uuid;
            store.insert_namespace(record.namespace).await;
            for member in record.members {
                store
                    .add_member(uuid, member.server_uuid, member.status)
                    .await;
            }
            for status in record.tool_statuses {
                store.set_tool_status(uuid, status).await;
            }
        }
        for rule in snapshot.tool_overrides {
            store.insert_override(rule).await;
        }
        for rule in snapshot.rate_limit_rules {
            store.rules.write().await.insert(rule.uuid, rule);
        }
        for policy in snapshot.policies {
            store.insert_policy(policy).await;
        }
        store
    }

    pub async fn insert_server(&self, server: McpServer) {
        self.servers.write().await.insert(server.uuid, server);
    }

    pub async fn remove_server(&self, uuid: ServerId) -> Option<McpServer> {
        self.servers.write().await.remove(&uuid)
    }

    pub async fn insert_namespace(&self, namespace: Namespace) {
        let uuid = namespace.uuid;
        let mut namespaces = self.namespaces.write().await;
        namespaces.entry(uuid).or_default().namespace = Some(namespace);
    }

    pub async fn remove_namespace(&self, uuid: NamespaceId) {
        self.namespaces.write().await.remove(&uuid);
        self.overrides
            .write()
            .await
            .retain(|o| o.namespace_uuid != uuid);
    }

    /// Add or update a namespace member
    pub async fn add_member(
        &self,
        namespace_uuid: NamespaceId,
        server_uuid: ServerId,
        status: ActivationStatus,
    ) {
        let mut namespaces = self.namespaces.write().await;
        let entry = namespaces.entry(namespace_uuid).or_default();
        match entry
            .members
            .iter_mut()
            .find(|m| m.server_uuid == server_uuid)
        {
            Some(member) => member.status = status,
            None => entry.members.push(NamespaceMember {
                server_uuid,
                status,
            }),
        }
    }

    pub async fn remove_member(&self, namespace_uuid: NamespaceId, server_uuid: ServerId) {
        if let Some(entry) = self.namespaces.write().await.get_mut(&namespace_uuid) {
            entry.members.retain(|m| m.server_uuid != server_uuid);
        }
    }

    pub async fn set_tool_status(&self, namespace_uuid: NamespaceId, status: NamespaceToolStatus) {
        let mut namespaces = self.namespaces.write().await;
        let entry = namespaces.entry(namespace_uuid).or_default();
        entry.tool_statuses.retain(|s| s.tool_name != status.tool_name);
        entry.tool_statuses.push(status);
    }

    /// Insert an override, replacing any row with the same key
    pub async fn insert_override(&self, rule: ToolOverride) {
        let mut overrides = self.overrides.write().await;
        overrides.retain(|o| {
            !(o.namespace_uuid == rule.namespace_uuid
                && o.server_name == rule.server_name
                && o.tool_name == rule.tool_name)
        });
        overrides.push(rule);
    }

    pub async fn clear_overrides(&self, namespace_uuid: NamespaceId) {
        self.overrides
            .write()
            .await
            .retain(|o| o.namespace_uuid != namespace_uuid);
    }

    pub async fn insert_policy(&self, policy: Policy) {
        self.policies.write().await.insert(policy.uuid, policy);
    }

    /// Catalog rows last written for a server
    pub async fn stored_tools(&self, server_uuid: ServerId) -> Vec<StoredTool> {
        self.tools
            .read()
            .await
            .get(&server_uuid)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of the audit log
    pub async fn tool_call_logs(&self) -> Vec<ToolCallLog> {
        self.logs.read().await.clone()
    }
}

#[async_trait]
impl ServerRepository for InMemoryStore {
    async fn find_by_uuid(&self, uuid: ServerId) -> RepoResult<Option<McpServer>> {
        Ok(self.servers.read().await.get(&uuid).cloned())
    }

    async fn find_by_name(&self, name: &str) -> RepoResult<Option<McpServer>> {
        Ok(self
            .servers
            .read()
            .await
            .values()
            .find(|s| s.name == name)
            .cloned())
    }

    async fn find_all(&self) -> RepoResult<Vec<McpServer>> {
        let mut servers: Vec<McpServer> = self.servers.read().await.values().cloned().collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(servers)
    }
}

#[async_trait]
impl NamespaceRepository for InMemoryStore {
    async fn find_namespace(&self, uuid: NamespaceId) -> RepoResult<Option<Namespace>> {
        Ok(self
            .namespaces
            .read()
            .await
            .get(&uuid)
            .and_then(|e| e.namespace.clone()))
    }

    async fn list_namespaces(&self) -> RepoResult<Vec<Namespace>> {
        Ok(self
            .namespaces
            .read()
            .await
            .values()
            .filter_map(|e| e.namespace.clone())
            .collect())
    }

    async fn find_servers(
        &self,
        namespace_uuid: NamespaceId,
        include_inactive: bool,
    ) -> RepoResult<Vec<McpServer>> {
        let namespaces = self.namespaces.read().await;
        let Some(entry) = namespaces.get(&namespace_uuid) else {
            return Ok(Vec::new());
        };
        let servers = self.servers.read().await;

        Ok(entry
            .members
            .iter()
            .filter(|m| include_inactive || m.status.is_active())
            .filter_map(|m| servers.get(&m.server_uuid))
            .filter(|s| include_inactive || s.status.is_active())
            .cloned()
            .collect())
    }

    async fn inactive_tools(
        &self,
        namespace_uuid: NamespaceId,
    ) -> RepoResult<Vec<NamespaceToolStatus>> {
        Ok(self
            .namespaces
            .read()
            .await
            .get(&namespace_uuid)
            .map(|e| {
                e.tool_statuses
                    .iter()
                    .filter(|s| !s.status.is_active())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl ToolOverrideRepository for InMemoryStore {
    async fn find_override(
        &self,
        namespace_uuid: NamespaceId,
        server_name: &str,
        tool_name: &str,
    ) -> RepoResult<Option<ToolOverride>> {
        Ok(self
            .overrides
            .read()
            .await
            .iter()
            .find(|o| {
                o.namespace_uuid == namespace_uuid
                    && o.server_name == server_name
                    && o.tool_name == tool_name
            })
            .cloned())
    }

    async fn find_by_override_name(
        &self,
        namespace_uuid: NamespaceId,
        server_name: &str,
        override_name: &str,
    ) -> RepoResult<Option<ToolOverride>> {
        Ok(self
            .overrides
            .read()
            .await
            .iter()
            .find(|o| {
                o.namespace_uuid == namespace_uuid
                    && o.server_name == server_name
                    && o.effective_name() == Some(override_name)
            })
            .cloned())
    }

    async fn list_for_server(
        &self,
        namespace_uuid: NamespaceId,
        server_name: &str,
    ) -> RepoResult<Vec<ToolOverride>> {
        Ok(self
            .overrides
            .read()
            .await
            .iter()
            .filter(|o| o.namespace_uuid == namespace_uuid && o.server_name == server_name)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ToolRepository for InMemoryStore {
    async fn upsert_tools(
        &self,
        server_uuid: ServerId,
        tools: Vec<StoredTool>,
    ) -> RepoResult<usize> {
        let count = tools.len();
        self.tools.write().await.insert(server_uuid, tools);
        Ok(count)
    }
}

#[async_trait]
impl RateLimitRuleRepository for InMemoryStore {
    async fn list_active_rules(&self, user_id: Option<&str>) -> RepoResult<Vec<RateLimitRule>> {
        Ok(self
            .rules
            .read()
            .await
            .values()
            .filter(|r| r.is_active)
            .filter(|r| match r.user_id.as_deref() {
                None => true,
                Some(owner) => Some(owner) == user_id,
            })
            .cloned()
            .collect())
    }

    async fn create_rule(&self, rule: RateLimitRule) -> RepoResult<RateLimitRule> {
        if rule.max_requests == 0 || rule.window_ms == 0 {
            return Err(RepositoryError::Validation(
                "max_requests and window_ms must be positive".to_string(),
            ));
        }
        let mut rules = self.rules.write().await;
        if rules.contains_key(&rule.uuid) {
            return Err(RepositoryError::Conflict(format!("rule {}", rule.uuid)));
        }
        rules.insert(rule.uuid, rule.clone());
        Ok(rule)
    }

    async fn update_rule(&self, rule: RateLimitRule) -> RepoResult<RateLimitRule> {
        let mut rules = self.rules.write().await;
        match rules.get_mut(&rule.uuid) {
            Some(existing) => {
                *existing = rule.clone();
                Ok(rule)
            }
            None => Err(RepositoryError::NotFound(format!("rule {}", rule.uuid))),
        }
    }

    async fn delete_rule(&self, uuid: RuleId) -> RepoResult<bool> {
        Ok(self.rules.write().await.remove(&uuid).is_some())
    }
}

#[async_trait]
impl PolicyRepository for InMemoryStore {
    async fn find_policy(&self, uuid: PolicyId) -> RepoResult<Option<Policy>> {
        Ok(self.policies.read().await.get(&uuid).cloned())
    }
}

#[async_trait]
impl ToolCallLogRepository for InMemoryStore {
    async fn insert_log(&self, log: ToolCallLog) -> RepoResult<()> {
        self.logs.write().await.push(log);
        Ok(())
    }

    async fn complete_log(
        &self,
        uuid: Uuid,
        outcome: ToolCallOutcome,
        duration_ms: u64,
    ) -> RepoResult<()> {
        let mut logs = self.logs.write().await;
        let log = logs
            .iter_mut()
            .find(|l| l.uuid == uuid)
            .ok_or_else(|| RepositoryError::NotFound(format!("tool call log {}", uuid)))?;

        match outcome {
            ToolCallOutcome::Result(value) => log.result = Some(value),
            ToolCallOutcome::Error(error) => log.error = Some(error),
        }
        log.duration_ms = Some(duration_ms);
        Ok(())
    }
}
