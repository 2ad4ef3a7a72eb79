//! Tool override middlewares
//!
//! Listing rewrites downstream tools with namespace overrides; calling maps an
//! override name back to the downstream name before routing.

use std::sync::Arc;

use async_trait::async_trait;

use super::{
    CallToolHandler, CallToolMiddleware, HandlerContext, ListToolsHandler, ListToolsMiddleware,
    ToolCallRequest,
};
use crate::error::GatewayResult;
use crate::mcp::types::{Tool, ToolCallResult};
use crate::overrides::ToolOverrides;

pub struct OverrideApplicationMiddleware {
    overrides: Arc<ToolOverrides>,
}

impl OverrideApplicationMiddleware {
    pub fn new(overrides: Arc<ToolOverrides>) -> Self {
        Self { overrides }
    }
}

#[async_trait]
impl ListToolsMiddleware for OverrideApplicationMiddleware {
    async fn handle(&self, ctx: HandlerContext, next: &ListToolsHandler) -> GatewayResult<Vec<Tool>> {
        let namespace_uuid = ctx.namespace_uuid;
        let tools = next(ctx).await?;
        Ok(self.overrides.apply_overrides(tools, namespace_uuid).await)
    }
}

pub struct OverrideResolutionMiddleware {
    overrides: Arc<ToolOverrides>,
}

impl OverrideResolutionMiddleware {
    pub fn new(overrides: Arc<ToolOverrides>) -> Self {
        Self { overrides }
    }
}

#[async_trait]
impl CallToolMiddleware for OverrideResolutionMiddleware {
    async fn handle(
        &self,
        mut request: ToolCallRequest,
        ctx: HandlerContext,
        next: &CallToolHandler,
    ) -> GatewayResult<ToolCallResult> {
        let original = self
            .overrides
            .map_override_name_to_original(&request.name, ctx.namespace_uuid)
            .await;
        if original != request.name {
            tracing::debug!(from = %request.name, to = %original, "Resolved override name");
            request.name = original;
        }
        next(request, ctx).await
    }
}
