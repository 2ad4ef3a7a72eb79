//! Rate limiting middleware

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{CallToolHandler, CallToolMiddleware, HandlerContext, ToolCallRequest};
use crate::error::GatewayResult;
use crate::mcp::types::ToolCallResult;
use crate::rate_limit::{FixedWindowLimiter, RateLimitRules};

pub const RATE_LIMITED_MESSAGE: &str =
    "Rate limit exceeded. Please wait before making more requests.";

/// Limit applied when no rule matches
#[derive(Debug, Clone, Copy)]
pub struct DefaultLimit {
    pub max_requests: u32,
    pub window: Duration,
}

pub struct RateLimitMiddleware {
    limiter: Arc<FixedWindowLimiter>,
    rules: Arc<RateLimitRules>,
    default_limit: Option<DefaultLimit>,
}

impl RateLimitMiddleware {
    pub fn new(
        limiter: Arc<FixedWindowLimiter>,
        rules: Arc<RateLimitRules>,
        default_limit: Option<DefaultLimit>,
    ) -> Self {
        Self {
            limiter,
            rules,
            default_limit,
        }
    }
}

#[async_trait]
impl CallToolMiddleware for RateLimitMiddleware {
    async fn handle(
        &self,
        request: ToolCallRequest,
        ctx: HandlerContext,
        next: &CallToolHandler,
    ) -> GatewayResult<ToolCallResult> {
        let identifier = ctx.user_id.as_deref().unwrap_or(&ctx.session_id);

        let rule = match self
            .rules
            .find_matching_rule(&request.name, ctx.user_id.as_deref())
            .await
        {
            Ok(rule) => rule,
            Err(e) => {
                tracing::warn!(tool = %request.name, error = %e, "Rate limit rule lookup failed, allowing call");
                return next(request, ctx).await;
            }
        };

        let (key, max_requests, window) = match (rule, self.default_limit) {
            (Some(rule), _) => (
                format!("rate_limit:{}:{}", rule.uuid, identifier),
                rule.max_requests,
                Duration::from_millis(rule.window_ms),
            ),
            (None, Some(default)) => (
                format!("rate_limit:default:{}", identifier),
                default.max_requests,
                default.window,
            ),
            (None, None) => return next(request, ctx).await,
        };

        let decision = self.limiter.check_limit(&key, max_requests, window).await;
        if !decision.allowed {
            tracing::warn!(
                session_id = %ctx.session_id,
                tool = %request.name,
                bucket = %key,
                retry_after_ms = decision.retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
            let mut result = ToolCallResult::error(RATE_LIMITED_MESSAGE);
            result.structured_content = Some(json!({
                "retryAfterMs": decision.retry_after.as_millis() as u64,
            }));
            return Ok(result);
        }

        next(request, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{call_layer, compose};
    use super::*;
    use metagate_shared::{
        InMemoryStore, NamespaceId, RateLimitRule, RateLimitRuleRepository, RepoResult, RepositoryError,
        RuleId,
    };
    use serde_json::Value;

    struct UnavailableRules;

    #[async_trait]
    impl RateLimitRuleRepository for UnavailableRules {
        async fn list_active_rules(&self, _user_id: Option<&str>) -> RepoResult<Vec<RateLimitRule>> {
            Err(RepositoryError::Unavailable("rules table offline".to_string()))
        }

        async fn create_rule(&self, rule: RateLimitRule) -> RepoResult<RateLimitRule> {
            Ok(rule)
        }

        async fn update_rule(&self, rule: RateLimitRule) -> RepoResult<RateLimitRule> {
            Ok(rule)
        }

        async fn delete_rule(&self, _uuid: RuleId) -> RepoResult<bool> {
            Ok(false)
        }
    }

    fn middleware(
        store: Arc<dyn RateLimitRuleRepository>,
        default_limit: Option<DefaultLimit>,
    ) -> CallToolHandler {
        let (terminal, _) = recording_terminal();
        let mw = RateLimitMiddleware::new(
            Arc::new(FixedWindowLimiter::new()),
            Arc::new(RateLimitRules::new(store)),
            default_limit,
        );
        compose(vec![call_layer(Arc::new(mw))], terminal)
    }

    async fn call(handler: &CallToolHandler, name: &str, session: &str) -> ToolCallResult {
        let mut c = ctx(NamespaceId::new());
        c.session_id = session.to_string();
        handler(ToolCallRequest::new(name, Value::Null), c).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_rule_limits_per_identifier() {
        let store = Arc::new(InMemoryStore::new());
        store
            .create_rule(RateLimitRule {
                uuid: RuleId::new(),
                name: "github".to_string(),
                tool_pattern: "github__*".to_string(),
                max_requests: 2,
                window_ms: 1000,
                user_id: None,
                is_active: true,
            })
            .await
            .unwrap();
        let handler = middleware(store, None);

        assert!(!call(&handler, "github__a", "s1").await.is_error);
        assert!(!call(&handler, "github__b", "s1").await.is_error);
        let denied = call(&handler, "github__a", "s1").await;
        assert!(denied.is_error);
        assert_eq!(denied.first_text(), Some(RATE_LIMITED_MESSAGE));

        // Other sessions and unmatched tools are unaffected
        assert!(!call(&handler, "github__a", "s2").await.is_error);
        assert!(!call(&handler, "fs__read", "s1").await.is_error);

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(!call(&handler, "github__a", "s1").await.is_error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_limit_applies_without_rules() {
        let handler = middleware(
            Arc::new(InMemoryStore::new()),
            Some(DefaultLimit {
                max_requests: 1,
                window: Duration::from_secs(60),
            }),
        );

        assert!(!call(&handler, "fs__read", "s1").await.is_error);
        assert!(call(&handler, "fs__write", "s1").await.is_error);
    }

    #[tokio::test]
    async fn test_inert_without_rules_or_default() {
        let handler = middleware(Arc::new(InMemoryStore::new()), None);
        for _ in 0..100 {
            assert!(!call(&handler, "fs__read", "s1").await.is_error);
        }
    }

    #[tokio::test]
    async fn test_rule_lookup_failure_allows_calls() {
        let handler = middleware(
            Arc::new(UnavailableRules),
            Some(DefaultLimit {
                max_requests: 1,
                window: Duration::from_secs(60),
            }),
        );

        for _ in 0..5 {
            let result = call(&handler, "github__a", "s1").await;
            assert!(!result.is_error);
        }
    }
}
