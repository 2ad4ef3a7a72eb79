//! Common types used across MetaGate

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

macro_rules! id_wrapper {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_wrapper!(
    /// Namespace ID wrapper
    NamespaceId
);
id_wrapper!(
    /// Downstream MCP server ID wrapper
    ServerId
);
id_wrapper!(
    /// Rate limit rule ID wrapper
    RuleId
);
id_wrapper!(
    /// Access policy ID wrapper
    PolicyId
);

// =============================================================================
// Downstream Servers
// =============================================================================

/// Transport type for a downstream MCP connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum McpTransport {
    Http {
        endpoint_url: String,
        #[serde(flatten)]
        auth: McpAuth,
    },
    Sse {
        endpoint_url: String,
        #[serde(flatten)]
        auth: McpAuth,
    },
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
}

impl McpTransport {
    pub fn kind(&self) -> &'static str {
        match self {
            McpTransport::Http { .. } => "http",
            McpTransport::Sse { .. } => "sse",
            McpTransport::Stdio { .. } => "stdio",
        }
    }
}

/// Authentication configuration for downstream MCPs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "auth_type", rename_all = "lowercase")]
pub enum McpAuth {
    #[default]
    None,
    Bearer {
        token: String,
    },
    ApiKey {
        header: String,
        value: String,
    },
    Basic {
        username: String,
        password: String,
    },
}

/// Activation status shared by servers, namespace members and tools
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationStatus {
    #[default]
    Active,
    Inactive,
}

impl ActivationStatus {
    pub fn is_active(self) -> bool {
        self == ActivationStatus::Active
    }
}

/// A registered downstream MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServer {
    pub uuid: ServerId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub transport: McpTransport,
    #[serde(default)]
    pub status: ActivationStatus,
}

impl McpServer {
    /// Resolve the connection parameters for this server.
    ///
    /// Returns `None` when the transport is missing the command or endpoint
    /// it needs to be reachable.
    pub fn to_params(&self) -> Option<ServerParams> {
        let usable = match &self.transport {
            McpTransport::Http { endpoint_url, .. } | McpTransport::Sse { endpoint_url, .. } => {
                !endpoint_url.trim().is_empty()
            }
            McpTransport::Stdio { command, .. } => !command.trim().is_empty(),
        };

        usable.then(|| ServerParams {
            uuid: self.uuid,
            name: self.name.clone(),
            transport: self.transport.clone(),
        })
    }
}

/// Resolved connection parameters for a downstream server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerParams {
    pub uuid: ServerId,
    pub name: String,
    pub transport: McpTransport,
}

// =============================================================================
// Namespaces
// =============================================================================

/// A named grouping of downstream servers exposed as one catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    pub uuid: NamespaceId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Membership of a server in a namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceMember {
    pub server_uuid: ServerId,
    #[serde(default)]
    pub status: ActivationStatus,
}

/// Per-namespace status of a single tool, keyed by its prefixed name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceToolStatus {
    pub tool_name: String,
    pub status: ActivationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// =============================================================================
// Tool Overrides
// =============================================================================

/// Namespace-scoped rename/redescribe/re-annotate rule for one tool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOverride {
    pub namespace_uuid: NamespaceId,
    pub server_name: String,
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_name: Option<String>,
    /// `None` leaves the title alone, `Some(None)` clears it.
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub override_title: Option<Option<String>>,
    /// An empty string is a real override, distinct from `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_annotations: Option<Map<String, Value>>,
}

impl ToolOverride {
    /// The rename target, if it is non-blank
    pub fn effective_name(&self) -> Option<&str> {
        self.override_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
    }
}

fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

// =============================================================================
// Rate Limits & Policies
// =============================================================================

/// Pattern-matched rate limit rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub uuid: RuleId,
    pub name: String,
    /// Glob matched against the client-visible tool name
    pub tool_pattern: String,
    pub max_requests: u32,
    pub window_ms: u64,
    /// `None` makes the rule global
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// Allow/deny glob lists of an access policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyRules {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// Access policy attached to calls through `_meta.policyId`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub uuid: PolicyId,
    pub name: String,
    #[serde(default)]
    pub rules: PolicyRules,
}

// =============================================================================
// Catalog & Audit Records
// =============================================================================

/// Tool row persisted when a downstream catalog is synced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTool {
    pub server_uuid: ServerId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

/// Audit row for one tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallLog {
    pub uuid: Uuid,
    pub session_id: String,
    pub namespace_uuid: NamespaceId,
    pub tool_name: String,
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_call_uuid: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Outcome written when a logged call completes
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallOutcome {
    Result(Value),
    Error(String),
}

// =============================================================================
// Registry Snapshot
// =============================================================================

/// Namespace with its members and tool statuses, as loaded from a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceRecord {
    #[serde(flatten)]
    pub namespace: Namespace,
    #[serde(default)]
    pub members: Vec<NamespaceMember>,
    #[serde(default)]
    pub tool_statuses: Vec<NamespaceToolStatus>,
}

/// Complete registry contents, used to seed the in-memory store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(default)]
    pub servers: Vec<McpServer>,
    #[serde(default)]
    pub namespaces: Vec<NamespaceRecord>,
    #[serde(default)]
    pub tool_overrides: Vec<ToolOverride>,
    #[serde(default)]
    pub rate_limit_rules: Vec<RateLimitRule>,
    #[serde(default)]
    pub policies: Vec<Policy>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio_server(command: &str) -> McpServer {
        McpServer {
            uuid: ServerId::new(),
            name: "fs".to_string(),
            description: None,
            transport: McpTransport::Stdio {
                command: command.to_string(),
                args: vec![],
                env: HashMap::new(),
            },
            status: ActivationStatus::Active,
        }
    }

    #[test]
    fn test_params_require_command() {
        assert!(stdio_server("npx").to_params().is_some());
        assert!(stdio_server("  ").to_params().is_none());
    }

    #[test]
    fn test_override_title_distinguishes_null_from_absent() {
        let ns = NamespaceId::new();
        let cleared: ToolOverride = serde_json::from_value(serde_json::json!({
            "namespace_uuid": ns,
            "server_name": "github",
            "tool_name": "create_issue",
            "override_title": null
        }))
        .unwrap();
        assert_eq!(cleared.override_title, Some(None));

        let untouched: ToolOverride = serde_json::from_value(serde_json::json!({
            "namespace_uuid": ns,
            "server_name": "github",
            "tool_name": "create_issue"
        }))
        .unwrap();
        assert_eq!(untouched.override_title, None);
    }

    #[test]
    fn test_blank_override_name_is_ignored() {
        let rule = ToolOverride {
            override_name: Some("   ".to_string()),
            ..Default::default()
        };
        assert_eq!(rule.effective_name(), None);
    }

    #[test]
    fn test_transport_parsing() {
        let json = r#"{"type": "http", "endpoint_url": "https://example.com/mcp", "auth_type": "bearer", "token": "t"}"#;
        let transport: McpTransport = serde_json::from_str(json).unwrap();
        assert_eq!(transport.kind(), "http");
        assert!(matches!(
            transport,
            McpTransport::Http {
                auth: McpAuth::Bearer { .. },
                ..
            }
        ));
    }
}
