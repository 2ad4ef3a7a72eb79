//! Persistence contracts consumed by the gateway engine
//!
//! The engine only reads through these traits (plus a few fire-and-forget
//! writes for catalog sync and audit rows). Any backing store can be plugged
//! in; [`crate::InMemoryStore`] is the reference implementation.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::RepoResult;
use crate::types::*;

/// Server registry lookups
#[async_trait]
pub trait ServerRepository: Send + Sync {
    async fn find_by_uuid(&self, uuid: ServerId) -> RepoResult<Option<McpServer>>;

    async fn find_by_name(&self, name: &str) -> RepoResult<Option<McpServer>>;

    async fn find_all(&self) -> RepoResult<Vec<McpServer>>;
}

/// Namespace membership and per-namespace tool status
#[async_trait]
pub trait NamespaceRepository: Send + Sync {
    async fn find_namespace(&self, uuid: NamespaceId) -> RepoResult<Option<Namespace>>;

    async fn list_namespaces(&self) -> RepoResult<Vec<Namespace>>;

    /// Servers that belong to the namespace. Inactive members (or inactive
    /// servers) are only returned when `include_inactive` is set.
    async fn find_servers(
        &self,
        namespace_uuid: NamespaceId,
        include_inactive: bool,
    ) -> RepoResult<Vec<McpServer>>;

    /// Prefixed tool names marked inactive in the namespace
    async fn inactive_tools(
        &self,
        namespace_uuid: NamespaceId,
    ) -> RepoResult<Vec<NamespaceToolStatus>>;
}

/// Tool override rows
#[async_trait]
pub trait ToolOverrideRepository: Send + Sync {
    async fn find_override(
        &self,
        namespace_uuid: NamespaceId,
        server_name: &str,
        tool_name: &str,
    ) -> RepoResult<Option<ToolOverride>>;

    async fn find_by_override_name(
        &self,
        namespace_uuid: NamespaceId,
        server_name: &str,
        override_name: &str,
    ) -> RepoResult<Option<ToolOverride>>;

    /// All override rows configured for one server in a namespace
    async fn list_for_server(
        &self,
        namespace_uuid: NamespaceId,
        server_name: &str,
    ) -> RepoResult<Vec<ToolOverride>>;
}

/// Synced downstream tool catalog
#[async_trait]
pub trait ToolRepository: Send + Sync {
    /// Replace the stored catalog for a server, returning the row count
    async fn upsert_tools(&self, server_uuid: ServerId, tools: Vec<StoredTool>)
        -> RepoResult<usize>;
}

/// Rate limit rule rows
#[async_trait]
pub trait RateLimitRuleRepository: Send + Sync {
    /// Active rules visible to the caller: user-specific rules for `user_id`
    /// plus every global rule.
    async fn list_active_rules(&self, user_id: Option<&str>) -> RepoResult<Vec<RateLimitRule>>;

    async fn create_rule(&self, rule: RateLimitRule) -> RepoResult<RateLimitRule>;

    async fn update_rule(&self, rule: RateLimitRule) -> RepoResult<RateLimitRule>;

    async fn delete_rule(&self, uuid: RuleId) -> RepoResult<bool>;
}

/// Access policy rows
#[async_trait]
pub trait PolicyRepository: Send + Sync {
    async fn find_policy(&self, uuid: PolicyId) -> RepoResult<Option<Policy>>;
}

/// Tool call audit log
#[async_trait]
pub trait ToolCallLogRepository: Send + Sync {
    async fn insert_log(&self, log: ToolCallLog) -> RepoResult<()>;

    async fn complete_log(
        &self,
        uuid: Uuid,
        outcome: ToolCallOutcome,
        duration_ms: u64,
    ) -> RepoResult<()>;
}

