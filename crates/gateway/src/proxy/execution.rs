//! Sandboxed execution entry points
//!
//! `run_code` and `run_agent` hand work to external collaborators. Those
//! collaborators call tools back through the gateway's own pipeline using a
//! [`RestrictedInvoker`], which refuses to start another execution.

use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{GatewayError, GatewayResult};
use crate::mcp::types::{Tool, ToolCallResult};
use crate::middleware::{CallToolFn, CallToolHandler, HandlerContext, ToolCallRequest, META_POLICY_ID};

pub const RUN_CODE: &str = "run_code";
pub const RUN_AGENT: &str = "run_agent";
const RUN_PYTHON: &str = "run_python";
const SCRIPT_PREFIX: &str = "script__";

/// Names a sandboxed caller may never invoke
pub fn is_restricted(name: &str) -> bool {
    name == RUN_CODE || name == RUN_AGENT || name == RUN_PYTHON || name.starts_with(SCRIPT_PREFIX)
}

/// Runs user code that may call tools
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute(&self, code: &str, invoker: RestrictedInvoker) -> GatewayResult<Value>;
}

/// Runs an agent loop that may call tools
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, task: &str, invoker: RestrictedInvoker) -> GatewayResult<Value>;
}

/// Additional meta tools (search, save, memory, ...) served by the gateway itself
#[async_trait]
pub trait MetaToolProvider: Send + Sync {
    fn tools(&self) -> Vec<Tool>;

    fn handles(&self, name: &str) -> bool {
        self.tools().iter().any(|t| t.name == name)
    }

    async fn call(&self, request: &ToolCallRequest, ctx: &HandlerContext) -> GatewayResult<ToolCallResult>;
}

/// Forward reference to the composed call pipeline.
///
/// The terminal handler is built before the pipeline that wraps it, so it
/// reaches the pipeline through this slot, which is filled once at assembly.
#[derive(Default)]
pub struct ToolInvoker {
    slot: OnceLock<Weak<CallToolFn>>,
}

impl ToolInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill the slot. Fails if it was already filled.
    pub fn assign(&self, pipeline: &CallToolHandler) -> GatewayResult<()> {
        self.slot
            .set(Arc::downgrade(pipeline))
            .map_err(|_| GatewayError::Internal("Tool invoker assigned twice".to_string()))
    }

    pub fn pipeline(&self) -> GatewayResult<CallToolHandler> {
        self.slot
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| GatewayError::Internal("Tool pipeline is not assembled".to_string()))
    }
}

/// Tool access handed to sandboxed code and agents
#[derive(Clone)]
pub struct RestrictedInvoker {
    pipeline: CallToolHandler,
    ctx: HandlerContext,
    policy_id: Option<String>,
}

impl RestrictedInvoker {
    pub fn new(pipeline: CallToolHandler, ctx: HandlerContext, policy_id: Option<String>) -> Self {
        Self {
            pipeline,
            ctx,
            policy_id,
        }
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> GatewayResult<ToolCallResult> {
        if is_restricted(name) {
            tracing::warn!(
                session_id = %self.ctx.session_id,
                tool = %name,
                "Rejected recursive execution call"
            );
            return Err(GatewayError::RecursiveExecution(name.to_string()));
        }

        let mut request = ToolCallRequest::new(name, arguments);
        if let Some(policy_id) = &self.policy_id {
            let mut meta = Map::new();
            meta.insert(META_POLICY_ID.to_string(), Value::String(policy_id.clone()));
            request.meta = Some(meta);
        }

        (self.pipeline)(request, self.ctx.clone()).await
    }
}

pub(crate) fn run_code_tool() -> Tool {
    Tool::new(
        RUN_CODE,
        "Execute code in a sandbox. The code can call other tools in this namespace.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "code": {"type": "string", "description": "Code to execute"}
            },
            "required": ["code"]
        }),
    )
}

pub(crate) fn run_agent_tool() -> Tool {
    Tool::new(
        RUN_AGENT,
        "Run an agent that completes a task using the tools in this namespace.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {"type": "string", "description": "What the agent should do"},
                "policyId": {"type": "string", "description": "Policy applied to every tool the agent calls"}
            },
            "required": ["task"]
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::test_support::*;
    use metagate_shared::NamespaceId;

    #[test]
    fn test_restricted_names() {
        assert!(is_restricted("run_code"));
        assert!(is_restricted("run_agent"));
        assert!(is_restricted("run_python"));
        assert!(is_restricted("script__cleanup"));
        assert!(!is_restricted("github__run_code"));
    }

    #[tokio::test]
    async fn test_invoker_slot_is_assigned_once() {
        let invoker = ToolInvoker::new();
        assert!(matches!(invoker.pipeline(), Err(GatewayError::Internal(_))));

        let (pipeline, _) = recording_terminal();
        invoker.assign(&pipeline).unwrap();
        assert!(invoker.assign(&pipeline).is_err());
        assert!(invoker.pipeline().is_ok());

        drop(pipeline);
        assert!(invoker.pipeline().is_err());
    }

    #[tokio::test]
    async fn test_restricted_invoker_rejects_recursion_and_forwards_policy() {
        let seen_meta = Arc::new(std::sync::Mutex::new(None));
        let sink = seen_meta.clone();
        let pipeline: CallToolHandler = Arc::new(move |request, _ctx| {
            let sink = sink.clone();
            Box::pin(async move {
                *sink.lock().unwrap() = request.meta.clone();
                Ok(ToolCallResult::text("ok"))
            })
        });
        let invoker = RestrictedInvoker::new(pipeline, ctx(NamespaceId::new()), Some("p-1".to_string()));

        let err = invoker.call_tool("run_code", Value::Null).await.unwrap_err();
        assert!(matches!(err, GatewayError::RecursiveExecution(_)));

        invoker.call_tool("fs__read", Value::Null).await.unwrap();
        let meta = seen_meta.lock().unwrap().clone().unwrap();
        assert_eq!(meta[META_POLICY_ID], "p-1");
    }
}
