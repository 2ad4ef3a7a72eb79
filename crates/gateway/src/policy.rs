//! Access policy evaluation
//!
//! A policy is a pair of glob lists. Deny wins over allow, and a tool matching
//! neither list is denied.

use std::sync::Arc;

use glob::Pattern;
use metagate_shared::{Policy, PolicyId, PolicyRepository, PolicyRules};

use crate::error::GatewayResult;

fn matches_any(patterns: &[String], tool_name: &str) -> bool {
    patterns.iter().any(|raw| match Pattern::new(raw) {
        Ok(pattern) => pattern.matches(tool_name),
        Err(e) => {
            tracing::warn!(pattern = %raw, error = %e, "Skipping invalid policy pattern");
            false
        }
    })
}

/// Evaluate one tool name against a policy's rules
pub fn evaluate(rules: &PolicyRules, tool_name: &str) -> bool {
    if matches_any(&rules.deny, tool_name) {
        return false;
    }
    matches_any(&rules.allow, tool_name)
}

/// Outcome of a policy check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allowed,
    Denied { policy_name: String },
    /// The referenced policy does not exist
    UnknownPolicy,
}

pub struct PolicyEvaluator {
    repository: Arc<dyn PolicyRepository>,
}

impl PolicyEvaluator {
    pub fn new(repository: Arc<dyn PolicyRepository>) -> Self {
        Self { repository }
    }

    pub async fn find(&self, policy_id: PolicyId) -> GatewayResult<Option<Policy>> {
        Ok(self.repository.find_policy(policy_id).await?)
    }

    /// Store failures propagate; the caller decides how to surface them
    pub async fn check(&self, policy_id: PolicyId, tool_name: &str) -> GatewayResult<PolicyDecision> {
        let Some(policy) = self.find(policy_id).await? else {
            return Ok(PolicyDecision::UnknownPolicy);
        };

        if evaluate(&policy.rules, tool_name) {
            Ok(PolicyDecision::Allowed)
        } else {
            tracing::info!(
                policy = %policy.name,
                tool = %tool_name,
                "Tool call denied by policy"
            );
            Ok(PolicyDecision::Denied {
                policy_name: policy.name,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metagate_shared::InMemoryStore;

    fn rules(allow: &[&str], deny: &[&str]) -> PolicyRules {
        PolicyRules {
            allow: allow.iter().map(|s| s.to_string()).collect(),
            deny: deny.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let r = rules(&["github__*"], &["github__delete_*"]);
        assert!(evaluate(&r, "github__create_issue"));
        assert!(!evaluate(&r, "github__delete_repo"));
    }

    #[test]
    fn test_unmatched_is_denied() {
        let r = rules(&["fs__read_*"], &[]);
        assert!(!evaluate(&r, "fs__write_file"));
        assert!(!evaluate(&PolicyRules::default(), "anything"));
    }

    #[test]
    fn test_invalid_pattern_is_skipped() {
        let r = rules(&["[", "fs__*"], &[]);
        assert!(evaluate(&r, "fs__read_file"));
    }

    #[tokio::test]
    async fn test_check_decisions() {
        let store = Arc::new(InMemoryStore::new());
        let policy = Policy {
            uuid: PolicyId::new(),
            name: "read-only".to_string(),
            rules: rules(&["*__read_*"], &[]),
        };
        store.insert_policy(policy.clone()).await;
        let evaluator = PolicyEvaluator::new(store);

        assert_eq!(
            evaluator.check(policy.uuid, "fs__read_file").await.unwrap(),
            PolicyDecision::Allowed
        );
        assert_eq!(
            evaluator.check(policy.uuid, "fs__write_file").await.unwrap(),
            PolicyDecision::Denied {
                policy_name: "read-only".to_string()
            }
        );
        assert_eq!(
            evaluator.check(PolicyId::new(), "fs__write_file").await.unwrap(),
            PolicyDecision::UnknownPolicy
        );
    }
}
