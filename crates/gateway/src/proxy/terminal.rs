//! Terminal handlers of a namespace gateway
//!
//! The call terminal serves meta tools and execution entry points, and routes
//! everything else to the downstream server that owns the tool. The list
//! terminal aggregates the catalogs of every active server in the namespace.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use metagate_shared::{McpServer, NamespaceId, ServerParams, StoredTool};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use super::execution::{
    run_agent_tool, run_code_tool, RestrictedInvoker, ToolInvoker, RUN_AGENT, RUN_CODE,
};
use super::GatewayDeps;
use crate::error::{GatewayError, GatewayResult};
use crate::mcp::client::{CallOptions, DownstreamClient};
use crate::mcp::tool_name::{parse_tool_name, prefix_tool_name};
use crate::mcp::types::{Tool, ToolCallParams, ToolCallResult};
use crate::middleware::{HandlerContext, ToolCallRequest, META_POLICY_ID};

pub const LOAD_TOOL: &str = "load_tool";

/// Loaded tools kept per session before the oldest is evicted
pub const MAX_LOADED_TOOLS: usize = 200;

/// Upper bound on tools/list pages fetched from one server
const MAX_LIST_PAGES: usize = 100;

/// Name under which a gateway may itself be registered as a downstream server
pub fn unified_server_name(namespace_uuid: NamespaceId) -> String {
    format!("metagate-unified-{}", namespace_uuid)
}

/// Where a prefixed tool name is served from
#[derive(Debug, Clone)]
struct Route {
    params: ServerParams,
    tool_name: String,
}

/// Insertion-ordered set with FIFO eviction
#[derive(Default)]
struct LoadedTools {
    order: VecDeque<String>,
    names: HashSet<String>,
}

impl LoadedTools {
    /// Returns false when the tool was already loaded
    fn insert(&mut self, name: String) -> bool {
        if self.names.contains(&name) {
            return false;
        }
        if self.order.len() >= MAX_LOADED_TOOLS {
            if let Some(evicted) = self.order.pop_front() {
                self.names.remove(&evicted);
            }
        }
        self.names.insert(name.clone());
        self.order.push_back(name);
        true
    }

    fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}

pub(crate) struct GatewayCore {
    namespace_uuid: NamespaceId,
    deps: GatewayDeps,
    routes: RwLock<HashMap<String, Route>>,
    loaded: Mutex<LoadedTools>,
    pub(crate) invoker: ToolInvoker,
}

impl GatewayCore {
    pub(crate) fn new(deps: GatewayDeps, namespace_uuid: NamespaceId) -> Self {
        Self {
            namespace_uuid,
            deps,
            routes: RwLock::new(HashMap::new()),
            loaded: Mutex::new(LoadedTools::default()),
            invoker: ToolInvoker::new(),
        }
    }

    fn call_options(&self, ctx: &HandlerContext) -> CallOptions {
        CallOptions::with_cancel(self.deps.config.call_timeout(), ctx.cancel.child_token())
    }

    /// Tools served by the gateway itself
    fn meta_tools(&self) -> Vec<Tool> {
        let mut tools = vec![Tool::new(
            LOAD_TOOL,
            "Load a tool from a downstream server so it appears in the tool list.",
            json!({
                "type": "object",
                "properties": {
                    "toolName": {"type": "string", "description": "Prefixed tool name, e.g. github__create_issue"}
                },
                "required": ["toolName"]
            }),
        )];
        if self.deps.code_executor.is_some() {
            tools.push(run_code_tool());
        }
        if self.deps.agent_runner.is_some() {
            tools.push(run_agent_tool());
        }
        if let Some(provider) = &self.deps.meta_tools {
            tools.extend(provider.tools());
        }
        tools
    }

    pub(crate) fn loaded_tools(&self) -> Vec<String> {
        let loaded = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);
        loaded.order.iter().cloned().collect()
    }

    // =========================================================================
    // tools/call
    // =========================================================================

    pub(crate) async fn call(&self, request: ToolCallRequest, ctx: HandlerContext) -> GatewayResult<ToolCallResult> {
        match request.name.as_str() {
            LOAD_TOOL => self.load_tool(&request, &ctx).await,
            RUN_CODE => self.run_code(&request, ctx).await,
            RUN_AGENT => self.run_agent(&request, ctx).await,
            name => {
                if let Some(provider) = &self.deps.meta_tools {
                    if provider.handles(name) {
                        return provider.call(&request, &ctx).await;
                    }
                }
                self.route(request, ctx).await
            }
        }
    }

    async fn load_tool(&self, request: &ToolCallRequest, ctx: &HandlerContext) -> GatewayResult<ToolCallResult> {
        let Some(requested) = request
            .arguments
            .get("toolName")
            .or_else(|| request.arguments.get("name"))
            .and_then(Value::as_str)
        else {
            return Ok(ToolCallResult::error("Missing required argument 'toolName'"));
        };

        // Clients see override names; the loaded set holds downstream names
        let name = self
            .deps
            .overrides
            .map_override_name_to_original(requested, self.namespace_uuid)
            .await;

        if self.find_route(&name, ctx).await?.is_none() {
            return Ok(ToolCallResult::error(format!("Tool not found: {}", requested)));
        }

        let inserted = self
            .loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone());

        tracing::debug!(session_id = %ctx.session_id, tool = %name, inserted, "Tool loaded");
        Ok(ToolCallResult::text(if inserted {
            format!("Loaded tool {}", requested)
        } else {
            format!("Tool {} is already loaded", requested)
        }))
    }

    async fn run_code(&self, request: &ToolCallRequest, ctx: HandlerContext) -> GatewayResult<ToolCallResult> {
        let Some(executor) = self.deps.code_executor.clone() else {
            return Ok(ToolCallResult::error("Code execution is not available"));
        };
        let Some(code) = request.arguments.get("code").and_then(Value::as_str) else {
            return Ok(ToolCallResult::error("Missing required argument 'code'"));
        };

        let invoker = RestrictedInvoker::new(self.invoker.pipeline()?, ctx, None);
        match executor.execute(code, invoker).await {
            Ok(value) => Ok(ToolCallResult::json(&value)),
            Err(e) => {
                tracing::warn!(error = %e, "Code execution failed");
                Ok(ToolCallResult::error(format!("Execution failed: {}", e)))
            }
        }
    }

    async fn run_agent(&self, request: &ToolCallRequest, ctx: HandlerContext) -> GatewayResult<ToolCallResult> {
        let Some(runner) = self.deps.agent_runner.clone() else {
            return Ok(ToolCallResult::error("Agent execution is not available"));
        };
        let Some(task) = request.arguments.get("task").and_then(Value::as_str) else {
            return Ok(ToolCallResult::error("Missing required argument 'task'"));
        };

        let policy_id = request
            .arguments
            .get(META_POLICY_ID)
            .and_then(Value::as_str)
            .or_else(|| request.meta_str(META_POLICY_ID))
            .map(str::to_string);

        let invoker = RestrictedInvoker::new(self.invoker.pipeline()?, ctx, policy_id);
        match runner.run(task, invoker).await {
            Ok(value) => Ok(ToolCallResult::json(&value)),
            Err(e) => {
                tracing::warn!(error = %e, "Agent run failed");
                Ok(ToolCallResult::error(format!("Agent failed: {}", e)))
            }
        }
    }

    /// Look up a route, refreshing the catalog once on a miss
    async fn find_route(&self, name: &str, ctx: &HandlerContext) -> GatewayResult<Option<Route>> {
        if let Some(route) = self.routes.read().await.get(name) {
            return Ok(Some(route.clone()));
        }

        tracing::debug!(tool = %name, "Route miss, refreshing catalog");
        self.refresh_catalog(ctx).await?;
        Ok(self.routes.read().await.get(name).cloned())
    }

    async fn route(&self, request: ToolCallRequest, ctx: HandlerContext) -> GatewayResult<ToolCallResult> {
        if parse_tool_name(&request.name).is_none() {
            return Err(GatewayError::InvalidToolName(request.name));
        }
        let Some(route) = self.find_route(&request.name, &ctx).await? else {
            return Err(GatewayError::NotFound(format!("tool {}", request.name)));
        };

        let client = self.client_for(&route.params, &ctx).await?;
        let params = ToolCallParams {
            name: route.tool_name.clone(),
            arguments: request.arguments,
            meta: request.meta,
        };

        match client.call_tool(params, &self.call_options(&ctx)).await {
            Err(e) if e.is_connection_loss() => {
                self.deps
                    .connections
                    .remove_client(&ctx.session_id, route.params.uuid)
                    .await;
                self.deps
                    .connections
                    .report_crash(route.params.uuid, &route.params.name, &e.to_string())
                    .await;
                Err(e)
            }
            other => other,
        }
    }

    async fn client_for(&self, params: &ServerParams, ctx: &HandlerContext) -> GatewayResult<Arc<dyn DownstreamClient>> {
        match self
            .deps
            .connections
            .get_client(&ctx.session_id, params, &ctx.cancel)
            .await
        {
            Err(e) if e.is_connection_loss() => {
                self.deps
                    .connections
                    .report_crash(params.uuid, &params.name, &e.to_string())
                    .await;
                Err(e)
            }
            other => other,
        }
    }

    // =========================================================================
    // tools/list
    // =========================================================================

    pub(crate) async fn list(&self, ctx: HandlerContext) -> GatewayResult<Vec<Tool>> {
        let downstream = self.refresh_catalog(&ctx).await?;
        let mut tools = self.meta_tools();

        if self.deps.config.deferred_tool_loading {
            let loaded = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);
            tools.extend(downstream.into_iter().filter(|t| loaded.contains(&t.name)));
        } else {
            tools.extend(downstream);
        }
        Ok(tools)
    }

    /// Fetch every server's tools and rebuild the routing table
    async fn refresh_catalog(&self, ctx: &HandlerContext) -> GatewayResult<Vec<Tool>> {
        let servers = self
            .deps
            .namespaces
            .find_servers(self.namespace_uuid, false)
            .await?;
        let own_name = unified_server_name(self.namespace_uuid);

        let results = futures::future::join_all(
            servers
                .into_iter()
                .filter(|server| server.name != own_name)
                .map(|server| async move {
                    let result = self.list_server_tools(&server, ctx).await;
                    (server, result)
                }),
        )
        .await;

        let mut tools = Vec::new();
        let mut routes = HashMap::new();
        for (server, result) in results {
            match result {
                Ok(entries) => {
                    for (tool, route) in entries {
                        routes.insert(tool.name.clone(), route);
                        tools.push(tool);
                    }
                }
                Err(e) => tracing::warn!(
                    namespace_uuid = %self.namespace_uuid,
                    server = %server.name,
                    error = %e,
                    "Skipping server while listing tools"
                ),
            }
        }

        *self.routes.write().await = routes;
        Ok(tools)
    }

    async fn list_server_tools(&self, server: &McpServer, ctx: &HandlerContext) -> GatewayResult<Vec<(Tool, Route)>> {
        let Some(params) = server.to_params() else {
            tracing::warn!(server = %server.name, "Server has no usable transport parameters");
            return Ok(Vec::new());
        };

        let client = self.client_for(&params, ctx).await?;
        if !client.supports_tools() {
            return Ok(Vec::new());
        }

        let options = self.call_options(ctx);
        let mut downstream = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let page = match client.list_tools(cursor.clone(), &options).await {
                Ok(page) => page,
                Err(e) if e.is_connection_loss() => {
                    self.deps.connections.remove_client(&ctx.session_id, params.uuid).await;
                    self.deps
                        .connections
                        .report_crash(params.uuid, &params.name, &e.to_string())
                        .await;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            downstream.extend(page.tools);
            match page.next_cursor {
                Some(next) if Some(&next) != cursor.as_ref() => cursor = Some(next),
                _ => break,
            }
        }

        let downstream = self
            .deps
            .overrides
            .filter_out_override_tools(downstream, self.namespace_uuid, &server.name)
            .await;

        self.sync_catalog(&params, &downstream);

        Ok(downstream
            .into_iter()
            .map(|mut tool| {
                let route = Route {
                    params: params.clone(),
                    tool_name: tool.name.clone(),
                };
                tool.name = prefix_tool_name(&server.name, &tool.name);
                (tool, route)
            })
            .collect())
    }

    /// Persist a server's catalog in the background when its tool set changed
    fn sync_catalog(&self, params: &ServerParams, tools: &[Tool]) {
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        if !self.deps.sync_cache.should_sync(params.uuid, &names) {
            return;
        }

        let stored: Vec<StoredTool> = tools
            .iter()
            .map(|t| StoredTool {
                server_uuid: params.uuid,
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
            })
            .collect();
        let repository = self.deps.tool_repository.clone();
        let sync_cache = self.deps.sync_cache.clone();
        let server_uuid = params.uuid;
        let server = params.name.clone();

        tokio::spawn(async move {
            match repository.upsert_tools(server_uuid, stored).await {
                Ok(count) => tracing::debug!(server = %server, count, "Tool catalog synced"),
                Err(e) => {
                    // Forget the hash so the next listing retries
                    sync_cache.clear(Some(server_uuid));
                    tracing::warn!(server = %server, error = %e, "Tool catalog sync failed");
                }
            }
        });
    }
}
