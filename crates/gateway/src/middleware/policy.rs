//! Access policy middleware

use std::sync::Arc;

use async_trait::async_trait;

use super::{CallToolHandler, CallToolMiddleware, HandlerContext, ToolCallRequest};
use crate::error::GatewayResult;
use crate::mcp::types::ToolCallResult;
use crate::policy::{PolicyDecision, PolicyEvaluator};

pub struct PolicyMiddleware {
    evaluator: Arc<PolicyEvaluator>,
}

impl PolicyMiddleware {
    pub fn new(evaluator: Arc<PolicyEvaluator>) -> Self {
        Self { evaluator }
    }
}

pub fn denied_message(tool_name: &str, policy_name: &str) -> String {
    format!(
        "Access denied to tool '{}' by policy '{}'.",
        tool_name, policy_name
    )
}

#[async_trait]
impl CallToolMiddleware for PolicyMiddleware {
    async fn handle(
        &self,
        request: ToolCallRequest,
        ctx: HandlerContext,
        next: &CallToolHandler,
    ) -> GatewayResult<ToolCallResult> {
        let Some(policy_id) = request.policy_id() else {
            return next(request, ctx).await;
        };

        match self.evaluator.check(policy_id, &request.name).await? {
            PolicyDecision::Allowed => next(request, ctx).await,
            PolicyDecision::UnknownPolicy => {
                tracing::warn!(
                    policy_id = %policy_id,
                    tool = %request.name,
                    "Policy not found, continuing without it"
                );
                next(request, ctx).await
            }
            PolicyDecision::Denied { policy_name } => Ok(ToolCallResult::error(denied_message(
                &request.name,
                &policy_name,
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{call_layer, compose, META_POLICY_ID};
    use super::*;
    use metagate_shared::{InMemoryStore, NamespaceId, Policy, PolicyId, PolicyRules};
    use serde_json::Value;

    async fn setup() -> (CallToolHandler, PolicyId, Arc<std::sync::Mutex<Vec<String>>>) {
        let store = Arc::new(InMemoryStore::new());
        let policy = Policy {
            uuid: PolicyId::new(),
            name: "read-only".to_string(),
            rules: PolicyRules {
                allow: vec!["*__read*".to_string()],
                deny: vec![],
            },
        };
        store.insert_policy(policy.clone()).await;

        let (terminal, seen) = recording_terminal();
        let middleware = PolicyMiddleware::new(Arc::new(PolicyEvaluator::new(store)));
        (compose(vec![call_layer(Arc::new(middleware))], terminal), policy.uuid, seen)
    }

    fn request(name: &str, policy: &str) -> ToolCallRequest {
        ToolCallRequest::new(name, Value::Null).with_meta(META_POLICY_ID, Value::String(policy.to_string()))
    }

    #[tokio::test]
    async fn test_denied_call_short_circuits() {
        let (handler, policy, seen) = setup().await;
        let ns = NamespaceId::new();

        let result = handler(request("fs__write", &policy.to_string()), ctx(ns))
            .await
            .unwrap();
        assert!(result.is_error);
        assert_eq!(
            result.first_text(),
            Some("Access denied to tool 'fs__write' by policy 'read-only'.")
        );
        assert!(seen.lock().unwrap().is_empty());

        let result = handler(request("fs__read_file", &policy.to_string()), ctx(ns))
            .await
            .unwrap();
        assert!(!result.is_error);
    }

    #[tokio::test]
    async fn test_unknown_or_missing_policy_passes_through() {
        let (handler, _, seen) = setup().await;
        let ns = NamespaceId::new();

        handler(request("fs__write", &PolicyId::new().to_string()), ctx(ns))
            .await
            .unwrap();
        handler(ToolCallRequest::new("fs__write", Value::Null), ctx(ns))
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
