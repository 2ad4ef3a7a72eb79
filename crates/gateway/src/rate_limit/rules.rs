//! Rate limit rule resolution and rule CRUD
//!
//! Rules are cached per user for a minute and the whole cache is dropped on
//! any mutation made through this service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use glob::Pattern;
use metagate_shared::{RateLimitRule, RateLimitRuleRepository, RuleId};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::GatewayResult;

/// How long a user's rule set is reused before reloading
pub const RULE_CACHE_TTL: Duration = Duration::from_secs(60);

struct CachedRules {
    rules: Arc<Vec<RateLimitRule>>,
    loaded_at: Instant,
}

/// Pick the matching rule with the longest pattern string.
///
/// Longer patterns are treated as more specific. Invalid patterns never match.
pub fn select_rule<'a>(rules: &'a [RateLimitRule], tool_name: &str) -> Option<&'a RateLimitRule> {
    rules
        .iter()
        .filter(|rule| rule.is_active)
        .filter(|rule| match Pattern::new(&rule.tool_pattern) {
            Ok(pattern) => pattern.matches(tool_name),
            Err(e) => {
                tracing::warn!(
                    rule = %rule.name,
                    pattern = %rule.tool_pattern,
                    error = %e,
                    "Skipping rate limit rule with invalid pattern"
                );
                false
            }
        })
        .max_by_key(|rule| rule.tool_pattern.len())
}

pub struct RateLimitRules {
    repository: Arc<dyn RateLimitRuleRepository>,
    // Keyed by user id; `None` holds the global-only set
    cache: RwLock<HashMap<Option<String>, CachedRules>>,
    ttl: Duration,
}

impl RateLimitRules {
    pub fn new(repository: Arc<dyn RateLimitRuleRepository>) -> Self {
        Self {
            repository,
            cache: RwLock::new(HashMap::new()),
            ttl: RULE_CACHE_TTL,
        }
    }

    /// Active rules visible to a user (user-specific plus global)
    pub async fn rules_for(&self, user_id: Option<&str>) -> GatewayResult<Arc<Vec<RateLimitRule>>> {
        let key = user_id.map(str::to_string);
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(&key) {
                if cached.loaded_at.elapsed() < self.ttl {
                    return Ok(cached.rules.clone());
                }
            }
        }

        let rules = Arc::new(self.repository.list_active_rules(user_id).await?);
        self.cache.write().await.insert(
            key,
            CachedRules {
                rules: rules.clone(),
                loaded_at: Instant::now(),
            },
        );
        Ok(rules)
    }

    /// The rule governing a call, if any
    pub async fn find_matching_rule(
        &self,
        tool_name: &str,
        user_id: Option<&str>,
    ) -> GatewayResult<Option<RateLimitRule>> {
        let rules = self.rules_for(user_id).await?;
        Ok(select_rule(&rules, tool_name).cloned())
    }

    pub async fn invalidate(&self) {
        self.cache.write().await.clear();
        tracing::debug!("Rate limit rule cache invalidated");
    }

    pub async fn create_rule(&self, rule: RateLimitRule) -> GatewayResult<RateLimitRule> {
        let created = self.repository.create_rule(rule).await?;
        self.invalidate().await;
        tracing::info!(rule = %created.name, pattern = %created.tool_pattern, "Rate limit rule created");
        Ok(created)
    }

    pub async fn update_rule(&self, rule: RateLimitRule) -> GatewayResult<RateLimitRule> {
        let updated = self.repository.update_rule(rule).await?;
        self.invalidate().await;
        Ok(updated)
    }

    pub async fn delete_rule(&self, uuid: RuleId) -> GatewayResult<bool> {
        let deleted = self.repository.delete_rule(uuid).await?;
        self.invalidate().await;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metagate_shared::InMemoryStore;

    fn rule(pattern: &str, user_id: Option<&str>) -> RateLimitRule {
        RateLimitRule {
            uuid: RuleId::new(),
            name: format!("rule {}", pattern),
            tool_pattern: pattern.to_string(),
            max_requests: 10,
            window_ms: 1000,
            user_id: user_id.map(str::to_string),
            is_active: true,
        }
    }

    #[test]
    fn test_longest_pattern_wins() {
        let rules = vec![rule("*", None), rule("github__*", None), rule("github__create_*", None)];
        let selected = select_rule(&rules, "github__create_issue").unwrap();
        assert_eq!(selected.tool_pattern, "github__create_*");

        let selected = select_rule(&rules, "fs__read").unwrap();
        assert_eq!(selected.tool_pattern, "*");
    }

    #[test]
    fn test_inactive_and_invalid_rules_are_ignored() {
        let mut inactive = rule("github__*", None);
        inactive.is_active = false;
        let rules = vec![inactive, rule("[github", None)];
        assert!(select_rule(&rules, "github__create_issue").is_none());
    }

    #[tokio::test]
    async fn test_user_rules_and_global_rules_are_visible() {
        let store = Arc::new(InMemoryStore::new());
        let service = RateLimitRules::new(store);
        service.create_rule(rule("*", None)).await.unwrap();
        service.create_rule(rule("github__*", Some("alice"))).await.unwrap();

        assert_eq!(service.rules_for(Some("alice")).await.unwrap().len(), 2);
        assert_eq!(service.rules_for(Some("bob")).await.unwrap().len(), 1);
        assert_eq!(service.rules_for(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mutations_invalidate_cache() {
        let store = Arc::new(InMemoryStore::new());
        let service = RateLimitRules::new(store);

        assert!(service
            .find_matching_rule("github__create_issue", None)
            .await
            .unwrap()
            .is_none());

        let created = service.create_rule(rule("github__*", None)).await.unwrap();
        assert_eq!(
            service
                .find_matching_rule("github__create_issue", None)
                .await
                .unwrap()
                .map(|r| r.uuid),
            Some(created.uuid)
        );

        assert!(service.delete_rule(created.uuid).await.unwrap());
        assert!(service
            .find_matching_rule("github__create_issue", None)
            .await
            .unwrap()
            .is_none());
    }
}
