//! Tool call logging middleware
//!
//! Emits a tracing event per call and, when a log repository is configured,
//! writes an audit row. Row writes run on spawned tasks and never affect the
//! call result.

use std::sync::Arc;

use async_trait::async_trait;
use metagate_shared::{ToolCallLog, ToolCallLogRepository, ToolCallOutcome};
use time::OffsetDateTime;
use tokio::time::Instant;
use uuid::Uuid;

use super::{CallToolHandler, CallToolMiddleware, HandlerContext, ToolCallRequest};
use crate::error::GatewayResult;
use crate::mcp::types::ToolCallResult;

pub struct LoggingMiddleware {
    repository: Option<Arc<dyn ToolCallLogRepository>>,
}

impl LoggingMiddleware {
    pub fn new(repository: Option<Arc<dyn ToolCallLogRepository>>) -> Self {
        Self { repository }
    }
}

fn outcome_of(result: &GatewayResult<ToolCallResult>) -> ToolCallOutcome {
    match result {
        Ok(r) if r.is_error => ToolCallOutcome::Error(r.first_text().unwrap_or("Tool returned an error").to_string()),
        Ok(r) => match serde_json::to_value(r) {
            Ok(value) => ToolCallOutcome::Result(value),
            Err(e) => ToolCallOutcome::Error(format!("Unserializable result: {}", e)),
        },
        Err(e) => ToolCallOutcome::Error(e.to_string()),
    }
}

#[async_trait]
impl CallToolMiddleware for LoggingMiddleware {
    async fn handle(
        &self,
        request: ToolCallRequest,
        ctx: HandlerContext,
        next: &CallToolHandler,
    ) -> GatewayResult<ToolCallResult> {
        let start = Instant::now();
        let log_uuid = Uuid::new_v4();

        tracing::debug!(
            session_id = %ctx.session_id,
            namespace_uuid = %ctx.namespace_uuid,
            tool = %request.name,
            "Tool call started"
        );

        let pending = self.repository.clone().map(|repository| {
            let log = ToolCallLog {
                uuid: log_uuid,
                session_id: ctx.session_id.clone(),
                namespace_uuid: ctx.namespace_uuid,
                tool_name: request.name.clone(),
                arguments: request.arguments.clone(),
                result: None,
                error: None,
                duration_ms: None,
                parent_call_uuid: request.parent_call_uuid(),
                created_at: OffsetDateTime::now_utc(),
            };
            let writer = repository.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = writer.insert_log(log).await {
                    tracing::warn!(error = %e, "Failed to insert tool call log");
                    return false;
                }
                true
            });
            (handle, repository)
        });

        let tool_name = request.name.clone();
        let result = next(request, ctx.clone()).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(r) if r.is_error => tracing::warn!(
                session_id = %ctx.session_id,
                tool = %tool_name,
                duration_ms,
                "Tool call returned an error result"
            ),
            Ok(_) => tracing::info!(
                session_id = %ctx.session_id,
                tool = %tool_name,
                duration_ms,
                "Tool call completed"
            ),
            Err(e) => tracing::error!(
                session_id = %ctx.session_id,
                tool = %tool_name,
                duration_ms,
                error = %e,
                "Tool call failed"
            ),
        }

        if let Some((inserted, repository)) = pending {
            let outcome = outcome_of(&result);
            tokio::spawn(async move {
                // The row has to exist before it can be completed
                if !matches!(inserted.await, Ok(true)) {
                    return;
                }
                if let Err(e) = repository.complete_log(log_uuid, outcome, duration_ms).await {
                    tracing::warn!(log_uuid = %log_uuid, error = %e, "Failed to complete tool call log");
                }
            });
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{call_layer, compose, META_PARENT_CALL_UUID};
    use super::*;
    use crate::error::GatewayError;
    use metagate_shared::{InMemoryStore, NamespaceId};
    use serde_json::{json, Value};
    use std::time::Duration;

    async fn wait_for_completion(store: &InMemoryStore) -> Vec<ToolCallLog> {
        for _ in 0..50 {
            let logs = store.tool_call_logs().await;
            if logs.iter().all(|l| l.duration_ms.is_some()) && !logs.is_empty() {
                return logs;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        store.tool_call_logs().await
    }

    #[tokio::test]
    async fn test_writes_completed_log_row() {
        let store = Arc::new(InMemoryStore::new());
        let (terminal, _) = recording_terminal();
        let handler = compose(
            vec![call_layer(Arc::new(LoggingMiddleware::new(Some(store.clone()))))],
            terminal,
        );

        let parent = Uuid::new_v4();
        let request = ToolCallRequest::new("fs__read", json!({"path": "/tmp"}))
            .with_meta(META_PARENT_CALL_UUID, Value::String(parent.to_string()));
        handler(request, ctx(NamespaceId::new())).await.unwrap();

        let logs = wait_for_completion(&store).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].tool_name, "fs__read");
        assert_eq!(logs[0].parent_call_uuid, Some(parent));
        assert!(logs[0].result.is_some());
        assert!(logs[0].error.is_none());
    }

    #[tokio::test]
    async fn test_errors_are_recorded_and_returned() {
        let store = Arc::new(InMemoryStore::new());
        let failing: CallToolHandler = Arc::new(|_request, _ctx| {
            Box::pin(async { Err(GatewayError::Downstream("boom".to_string())) })
        });
        let handler = compose(
            vec![call_layer(Arc::new(LoggingMiddleware::new(Some(store.clone()))))],
            failing,
        );

        let result = handler(ToolCallRequest::new("fs__read", Value::Null), ctx(NamespaceId::new())).await;
        assert!(matches!(result, Err(GatewayError::Downstream(_))));

        let logs = wait_for_completion(&store).await;
        assert_eq!(logs[0].error.as_deref(), Some("Downstream error: boom"));
    }
}
