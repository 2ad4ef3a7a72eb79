//! Tool request middleware
//!
//! Every list/call request against a namespace gateway runs through a chain
//! of middlewares wrapped around a terminal handler.
//!
//! ```text
//! call: Logging -> Policy -> RateLimit -> Filter -> OverrideResolution -> terminal
//! list: OverrideApplication -> Filter -> terminal
//! ```

pub mod filter;
pub mod logging;
pub mod overrides;
pub mod policy;
pub mod rate_limit;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use metagate_shared::{NamespaceId, PolicyId};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::GatewayResult;
use crate::mcp::types::{Tool, ToolCallParams, ToolCallResult};

pub use filter::{FilterMiddleware, ToolStatusFilter};
pub use logging::LoggingMiddleware;
pub use overrides::{OverrideApplicationMiddleware, OverrideResolutionMiddleware};
pub use policy::PolicyMiddleware;
pub use rate_limit::RateLimitMiddleware;

/// Meta key carrying the access policy for a call
pub const META_POLICY_ID: &str = "policyId";
/// Meta key linking a nested call to the call that spawned it
pub const META_PARENT_CALL_UUID: &str = "parentCallUuid";

/// A decoded tools/call request
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub name: String,
    pub arguments: Value,
    pub meta: Option<Map<String, Value>>,
}

impl ToolCallRequest {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
            meta: None,
        }
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.as_ref()?.get(key)?.as_str()
    }

    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.meta
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value);
        self
    }

    /// `policyId` from meta, when present and well-formed
    pub fn policy_id(&self) -> Option<PolicyId> {
        let raw = self.meta_str(META_POLICY_ID)?;
        match Uuid::parse_str(raw) {
            Ok(id) => Some(PolicyId(id)),
            Err(_) => {
                tracing::warn!(policy_id = %raw, "Ignoring malformed policy id");
                None
            }
        }
    }

    pub fn parent_call_uuid(&self) -> Option<Uuid> {
        self.meta_str(META_PARENT_CALL_UUID)
            .and_then(|raw| Uuid::parse_str(raw).ok())
    }
}

impl From<ToolCallParams> for ToolCallRequest {
    fn from(params: ToolCallParams) -> Self {
        Self {
            name: params.name,
            arguments: params.arguments,
            meta: params.meta,
        }
    }
}

impl From<ToolCallRequest> for ToolCallParams {
    fn from(request: ToolCallRequest) -> Self {
        Self {
            name: request.name,
            arguments: request.arguments,
            meta: request.meta,
        }
    }
}

/// Per-request context handed down the chain
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub namespace_uuid: NamespaceId,
    pub session_id: String,
    pub user_id: Option<String>,
    /// Fired when the owning gateway shuts down
    pub cancel: CancellationToken,
}

pub type CallToolFn =
    dyn Fn(ToolCallRequest, HandlerContext) -> BoxFuture<'static, GatewayResult<ToolCallResult>> + Send + Sync;

pub type CallToolHandler = Arc<CallToolFn>;

pub type ListToolsHandler =
    Arc<dyn Fn(HandlerContext) -> BoxFuture<'static, GatewayResult<Vec<Tool>>> + Send + Sync>;

/// Wraps one handler into another
pub type Middleware<H> = Box<dyn FnOnce(H) -> H + Send>;

/// Wrap `terminal` so that the first middleware runs outermost
pub fn compose<H>(middlewares: Vec<Middleware<H>>, terminal: H) -> H {
    middlewares
        .into_iter()
        .rev()
        .fold(terminal, |next, middleware| middleware(next))
}

/// Middleware over tools/call
#[async_trait]
pub trait CallToolMiddleware: Send + Sync + 'static {
    async fn handle(
        &self,
        request: ToolCallRequest,
        ctx: HandlerContext,
        next: &CallToolHandler,
    ) -> GatewayResult<ToolCallResult>;
}

/// Middleware over tools/list
#[async_trait]
pub trait ListToolsMiddleware: Send + Sync + 'static {
    async fn handle(&self, ctx: HandlerContext, next: &ListToolsHandler) -> GatewayResult<Vec<Tool>>;
}

pub fn call_layer<M: CallToolMiddleware>(middleware: Arc<M>) -> Middleware<CallToolHandler> {
    Box::new(move |next: CallToolHandler| -> CallToolHandler {
        Arc::new(move |request, ctx| {
            let middleware = middleware.clone();
            let next = next.clone();
            Box::pin(async move { middleware.handle(request, ctx, &next).await })
        })
    })
}

pub fn list_layer<M: ListToolsMiddleware>(middleware: Arc<M>) -> Middleware<ListToolsHandler> {
    Box::new(move |next: ListToolsHandler| -> ListToolsHandler {
        Arc::new(move |ctx| {
            let middleware = middleware.clone();
            let next = next.clone();
            Box::pin(async move { middleware.handle(ctx, &next).await })
        })
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    pub fn ctx(namespace_uuid: NamespaceId) -> HandlerContext {
        HandlerContext {
            namespace_uuid,
            session_id: "session-1".to_string(),
            user_id: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Terminal that records the names it receives and echoes them back
    pub fn recording_terminal() -> (CallToolHandler, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: CallToolHandler = Arc::new(move |request, _ctx| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().unwrap().push(request.name.clone());
                Ok(ToolCallResult::text(request.name))
            })
        });
        (handler, seen)
    }

    pub fn static_list(tools: Vec<Tool>) -> ListToolsHandler {
        Arc::new(move |_ctx| {
            let tools = tools.clone();
            Box::pin(async move { Ok(tools) })
        })
    }
}
