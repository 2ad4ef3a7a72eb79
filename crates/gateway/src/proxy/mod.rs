//! Namespace gateway instances
//!
//! A [`NamespaceGateway`] is the virtual MCP server for one namespace. It owns
//! the composed middleware chains for tools/list and tools/call and is bound
//! to at most one client session at a time.

pub mod execution;
pub mod terminal;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use metagate_shared::{Namespace, NamespaceId, NamespaceRepository, ToolCallLogRepository, ToolRepository};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{GatewayError, GatewayResult};
use crate::mcp::connection_pool::ConnectionPool;
use crate::mcp::types::{Tool, ToolCallParams, ToolCallResult};
use crate::middleware::rate_limit::DefaultLimit;
use crate::middleware::{
    call_layer, compose, list_layer, CallToolHandler, FilterMiddleware, HandlerContext,
    ListToolsHandler, LoggingMiddleware, OverrideApplicationMiddleware,
    OverrideResolutionMiddleware, PolicyMiddleware, RateLimitMiddleware, ToolStatusFilter,
};
use crate::overrides::ToolOverrides;
use crate::policy::PolicyEvaluator;
use crate::rate_limit::{FixedWindowLimiter, RateLimitRules};
use crate::sync_cache::ToolsSyncCache;

pub use execution::{AgentRunner, CodeExecutor, MetaToolProvider, RestrictedInvoker, ToolInvoker};
pub use terminal::{unified_server_name, LOAD_TOOL, MAX_LOADED_TOOLS};

use terminal::GatewayCore;

/// A virtual MCP server for one namespace
#[async_trait]
pub trait GatewayServer: Send + Sync {
    fn namespace_uuid(&self) -> NamespaceId;

    /// The session this instance currently serves
    fn session_id(&self) -> String;

    /// Attach the instance to a client session
    async fn bind_session(&self, session_id: &str);

    async fn list_tools(&self) -> GatewayResult<Vec<Tool>>;

    async fn call_tool(&self, params: ToolCallParams) -> GatewayResult<ToolCallResult>;

    /// Release everything the instance holds. Safe to call more than once.
    async fn cleanup(&self);
}

pub type GatewayInstance = Arc<dyn GatewayServer>;

/// Builds gateway instances for the server pool
#[async_trait]
pub trait GatewayFactory: Send + Sync {
    async fn create(&self, namespace_uuid: NamespaceId, session_id: &str) -> GatewayResult<GatewayInstance>;
}

/// Shared services every gateway instance is assembled from
#[derive(Clone)]
pub struct GatewayDeps {
    pub config: Arc<Config>,
    pub namespaces: Arc<dyn NamespaceRepository>,
    pub tool_repository: Arc<dyn ToolRepository>,
    pub connections: Arc<ConnectionPool>,
    pub sync_cache: Arc<ToolsSyncCache>,
    pub overrides: Arc<ToolOverrides>,
    pub policies: Arc<PolicyEvaluator>,
    pub rate_limit_rules: Arc<RateLimitRules>,
    pub limiter: Arc<FixedWindowLimiter>,
    pub tool_status: Arc<ToolStatusFilter>,
    pub call_logs: Option<Arc<dyn ToolCallLogRepository>>,
    pub meta_tools: Option<Arc<dyn MetaToolProvider>>,
    pub code_executor: Option<Arc<dyn CodeExecutor>>,
    pub agent_runner: Option<Arc<dyn AgentRunner>>,
}

impl GatewayDeps {
    fn default_rate_limit(&self) -> Option<DefaultLimit> {
        self.config.rate_limit_enabled.then(|| DefaultLimit {
            max_requests: self.config.rate_limit_default_max_requests,
            window: Duration::from_millis(self.config.rate_limit_default_window_ms),
        })
    }
}

pub struct NamespaceGateway {
    namespace_uuid: NamespaceId,
    user_id: Option<String>,
    session_id: RwLock<String>,
    core: Arc<GatewayCore>,
    connections: Arc<ConnectionPool>,
    call_pipeline: CallToolHandler,
    list_pipeline: ListToolsHandler,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl NamespaceGateway {
    /// Build the terminal handlers, wrap them in middleware and wire the
    /// call pipeline back into the terminal for sandboxed execution.
    pub fn assemble(deps: GatewayDeps, namespace: &Namespace, session_id: &str) -> GatewayResult<Arc<Self>> {
        let core = Arc::new(GatewayCore::new(deps.clone(), namespace.uuid));

        let call_terminal: CallToolHandler = {
            let core = core.clone();
            Arc::new(move |request, ctx| {
                let core = core.clone();
                Box::pin(async move { core.call(request, ctx).await })
            })
        };
        let list_terminal: ListToolsHandler = {
            let core = core.clone();
            Arc::new(move |ctx| {
                let core = core.clone();
                Box::pin(async move { core.list(ctx).await })
            })
        };

        let filter = Arc::new(FilterMiddleware::new(
            deps.tool_status.clone(),
            Some(deps.overrides.clone()),
        ));

        let call_pipeline = compose(
            vec![
                call_layer(Arc::new(LoggingMiddleware::new(deps.call_logs.clone()))),
                call_layer(Arc::new(PolicyMiddleware::new(deps.policies.clone()))),
                call_layer(Arc::new(RateLimitMiddleware::new(
                    deps.limiter.clone(),
                    deps.rate_limit_rules.clone(),
                    deps.default_rate_limit(),
                ))),
                call_layer(filter.clone()),
                call_layer(Arc::new(OverrideResolutionMiddleware::new(deps.overrides.clone()))),
            ],
            call_terminal,
        );
        let list_pipeline = compose(
            vec![
                list_layer(Arc::new(OverrideApplicationMiddleware::new(deps.overrides.clone()))),
                list_layer(filter),
            ],
            list_terminal,
        );

        core.invoker.assign(&call_pipeline)?;

        Ok(Arc::new(Self {
            namespace_uuid: namespace.uuid,
            user_id: namespace.user_id.clone(),
            session_id: RwLock::new(session_id.to_string()),
            core,
            connections: deps.connections,
            call_pipeline,
            list_pipeline,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }))
    }

    fn context(&self) -> GatewayResult<HandlerContext> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GatewayError::Unavailable(format!(
                "gateway for namespace {} is closed",
                self.namespace_uuid
            )));
        }
        Ok(HandlerContext {
            namespace_uuid: self.namespace_uuid,
            session_id: self.session_id(),
            user_id: self.user_id.clone(),
            cancel: self.cancel.clone(),
        })
    }

    /// Downstream tools loaded into this session
    pub fn loaded_tools(&self) -> Vec<String> {
        self.core.loaded_tools()
    }
}

#[async_trait]
impl GatewayServer for NamespaceGateway {
    fn namespace_uuid(&self) -> NamespaceId {
        self.namespace_uuid
    }

    fn session_id(&self) -> String {
        self.session_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn bind_session(&self, session_id: &str) {
        let previous = {
            let mut current = self.session_id.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, session_id.to_string())
        };
        // Connections opened while idle belong to the placeholder session
        if previous != session_id {
            self.connections.cleanup_session(&previous).await;
        }
    }

    async fn list_tools(&self) -> GatewayResult<Vec<Tool>> {
        let ctx = self.context()?;
        (self.list_pipeline)(ctx).await
    }

    async fn call_tool(&self, params: ToolCallParams) -> GatewayResult<ToolCallResult> {
        let ctx = self.context()?;
        (self.call_pipeline)(params.into(), ctx).await
    }

    async fn cleanup(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        let session_id = self.session_id();
        self.connections.cleanup_session(&session_id).await;
        tracing::debug!(
            namespace_uuid = %self.namespace_uuid,
            session_id = %session_id,
            "Gateway instance cleaned up"
        );
    }
}

/// Production factory
pub struct NamespaceGatewayFactory {
    deps: GatewayDeps,
}

impl NamespaceGatewayFactory {
    pub fn new(deps: GatewayDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl GatewayFactory for NamespaceGatewayFactory {
    async fn create(&self, namespace_uuid: NamespaceId, session_id: &str) -> GatewayResult<GatewayInstance> {
        let namespace = self
            .deps
            .namespaces
            .find_namespace(namespace_uuid)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("namespace {}", namespace_uuid)))?;

        let gateway = NamespaceGateway::assemble(self.deps.clone(), &namespace, session_id)?;
        tracing::debug!(
            namespace_uuid = %namespace_uuid,
            session_id = %session_id,
            "Gateway instance created"
        );
        Ok(gateway)
    }
}
