//! Connection pool for downstream MCP servers
//!
//! Connections are opened lazily per (session, server) and closed when the
//! session ends or the server is invalidated by a reconnection.

use std::collections::HashMap;
use std::sync::Arc;

use metagate_shared::{ServerId, ServerParams};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

use super::client::{Connector, DownstreamClient};
use crate::crash::CrashTracker;
use crate::error::{GatewayError, GatewayResult};

/// Capacity of the crash broadcast channel
const CRASH_CHANNEL_CAPACITY: usize = 256;

/// A downstream connection was lost
#[derive(Debug, Clone)]
pub struct CrashSignal {
    pub server_uuid: ServerId,
    pub server_name: String,
    pub error: String,
    /// True when this crash pushed the server into the error state
    pub entered_error_state: bool,
}

/// Poll-based pool statistics
#[derive(Debug, Default, Clone, Serialize)]
pub struct ConnectionPoolStatus {
    pub sessions: usize,
    pub connections: usize,
}

type SessionConnections = HashMap<ServerId, Arc<dyn DownstreamClient>>;

/// Per-session downstream connections
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    crash_tracker: Arc<dyn CrashTracker>,
    sessions: RwLock<HashMap<String, SessionConnections>>,
    crash_tx: broadcast::Sender<CrashSignal>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, crash_tracker: Arc<dyn CrashTracker>) -> Self {
        let (crash_tx, _) = broadcast::channel(CRASH_CHANNEL_CAPACITY);
        Self {
            connector,
            crash_tracker,
            sessions: RwLock::new(HashMap::new()),
            crash_tx,
        }
    }

    /// Get the session's connection to a server, connecting on first use
    pub async fn get_client(
        &self,
        session_id: &str,
        params: &ServerParams,
        cancel: &CancellationToken,
    ) -> GatewayResult<Arc<dyn DownstreamClient>> {
        {
            let sessions = self.sessions.read().await;
            if let Some(client) = sessions.get(session_id).and_then(|s| s.get(&params.uuid)) {
                return Ok(client.clone());
            }
        }

        if self.crash_tracker.is_in_error_state(params.uuid).await {
            return Err(GatewayError::CrashErrorState(params.name.clone()));
        }

        let client = self.connector.connect(params, cancel).await?;

        let mut sessions = self.sessions.write().await;
        let connections = sessions.entry(session_id.to_string()).or_default();
        if let Some(existing) = connections.get(&params.uuid) {
            // Lost the race against a concurrent connect; keep the first one
            let existing = existing.clone();
            drop(sessions);
            client.close().await;
            return Ok(existing);
        }
        connections.insert(params.uuid, client.clone());

        tracing::debug!(
            session_id = %session_id,
            server = %params.name,
            "Downstream connection pooled"
        );
        Ok(client)
    }

    /// Drop and close one session's connection to a server
    pub async fn remove_client(&self, session_id: &str, server_uuid: ServerId) {
        let removed = {
            let mut sessions = self.sessions.write().await;
            sessions
                .get_mut(session_id)
                .and_then(|s| s.remove(&server_uuid))
        };
        if let Some(client) = removed {
            client.close().await;
        }
    }

    /// Close every connection owned by a session
    pub async fn cleanup_session(&self, session_id: &str) {
        let removed = self.sessions.write().await.remove(session_id);
        if let Some(connections) = removed {
            let count = connections.len();
            futures::future::join_all(connections.into_values().map(|c| async move {
                c.close().await;
            }))
            .await;
            tracing::debug!(session_id = %session_id, count, "Session connections closed");
        }
    }

    /// Close every connection in the pool
    pub async fn cleanup_all(&self) {
        let drained: Vec<SessionConnections> =
            self.sessions.write().await.drain().map(|(_, c)| c).collect();
        let clients: Vec<Arc<dyn DownstreamClient>> =
            drained.into_iter().flat_map(|c| c.into_values()).collect();
        let count = clients.len();
        futures::future::join_all(clients.into_iter().map(|c| async move {
            c.close().await;
        }))
        .await;
        tracing::info!(count, "All downstream connections closed");
    }

    /// Close a server's connections in every session; they reconnect on next use
    pub async fn invalidate_server(&self, server_uuid: ServerId) -> usize {
        let removed: Vec<Arc<dyn DownstreamClient>> = {
            let mut sessions = self.sessions.write().await;
            sessions
                .values_mut()
                .filter_map(|s| s.remove(&server_uuid))
                .collect()
        };
        let count = removed.len();
        futures::future::join_all(removed.into_iter().map(|c| async move {
            c.close().await;
        }))
        .await;

        if count > 0 {
            tracing::info!(server_uuid = %server_uuid, count, "Invalidated pooled connections");
        }
        count
    }

    /// Record a lost connection and notify crash subscribers
    pub async fn report_crash(&self, server_uuid: ServerId, server_name: &str, error: &str) {
        let entered_error_state = self.crash_tracker.record_crash(server_uuid).await;

        tracing::warn!(
            server_uuid = %server_uuid,
            server = %server_name,
            error = %error,
            "Downstream connection lost"
        );

        // No subscribers is fine
        let _ = self.crash_tx.send(CrashSignal {
            server_uuid,
            server_name: server_name.to_string(),
            error: error.to_string(),
            entered_error_state,
        });
    }

    /// Subscribe to crash signals
    pub fn subscribe_crashes(&self) -> broadcast::Receiver<CrashSignal> {
        self.crash_tx.subscribe()
    }

    pub async fn status(&self) -> ConnectionPoolStatus {
        let sessions = self.sessions.read().await;
        ConnectionPoolStatus {
            sessions: sessions.len(),
            connections: sessions.values().map(|s| s.len()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crash::ServerErrorTracker;
    use crate::mcp::client::CallOptions;
    use crate::mcp::types::*;
    use async_trait::async_trait;
    use metagate_shared::McpTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullClient {
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DownstreamClient for NullClient {
        fn server_info(&self) -> ServerInfo {
            ServerInfo::default()
        }

        fn supports_tools(&self) -> bool {
            true
        }

        async fn list_tools(
            &self,
            _cursor: Option<String>,
            _options: &CallOptions,
        ) -> GatewayResult<ToolsListResult> {
            Ok(ToolsListResult::default())
        }

        async fn call_tool(
            &self,
            _params: ToolCallParams,
            _options: &CallOptions,
        ) -> GatewayResult<ToolCallResult> {
            Ok(ToolCallResult::text("ok"))
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CountingConnector {
        connects: AtomicUsize,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(
            &self,
            _params: &ServerParams,
            _cancel: &CancellationToken,
        ) -> GatewayResult<Arc<dyn DownstreamClient>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NullClient {
                closed: self.closed.clone(),
            }))
        }
    }

    fn params(name: &str) -> ServerParams {
        ServerParams {
            uuid: ServerId::new(),
            name: name.to_string(),
            transport: McpTransport::Stdio {
                command: "echo".to_string(),
                args: vec![],
                env: Default::default(),
            },
        }
    }

    fn pool(connector: Arc<CountingConnector>, max_crashes: u32) -> ConnectionPool {
        ConnectionPool::new(connector, Arc::new(ServerErrorTracker::new(max_crashes)))
    }

    #[tokio::test]
    async fn test_connections_are_reused_per_session() {
        let connector = Arc::new(CountingConnector::default());
        let pool = pool(connector.clone(), 1);
        let server = params("fs");
        let cancel = CancellationToken::new();

        pool.get_client("s1", &server, &cancel).await.unwrap();
        pool.get_client("s1", &server, &cancel).await.unwrap();
        pool.get_client("s2", &server, &cancel).await.unwrap();

        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        let status = pool.status().await;
        assert_eq!(status.sessions, 2);
        assert_eq!(status.connections, 2);
    }

    #[tokio::test]
    async fn test_invalidate_server_closes_all_sessions() {
        let connector = Arc::new(CountingConnector::default());
        let pool = pool(connector.clone(), 1);
        let server = params("fs");
        let other = params("git");
        let cancel = CancellationToken::new();

        pool.get_client("s1", &server, &cancel).await.unwrap();
        pool.get_client("s2", &server, &cancel).await.unwrap();
        pool.get_client("s2", &other, &cancel).await.unwrap();

        assert_eq!(pool.invalidate_server(server.uuid).await, 2);
        assert_eq!(connector.closed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.status().await.connections, 1);
    }

    #[tokio::test]
    async fn test_crashed_server_refuses_connections() {
        let connector = Arc::new(CountingConnector::default());
        let pool = pool(connector.clone(), 1);
        let server = params("fs");
        let mut crashes = pool.subscribe_crashes();

        pool.report_crash(server.uuid, &server.name, "EOF").await;
        let signal = crashes.recv().await.unwrap();
        assert!(signal.entered_error_state);

        let result = pool
            .get_client("s1", &server, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(GatewayError::CrashErrorState(_))));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cleanup_session() {
        let connector = Arc::new(CountingConnector::default());
        let pool = pool(connector.clone(), 1);
        let cancel = CancellationToken::new();

        pool.get_client("s1", &params("a"), &cancel).await.unwrap();
        pool.get_client("s1", &params("b"), &cancel).await.unwrap();
        pool.cleanup_session("s1").await;

        assert_eq!(connector.closed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.status().await.sessions, 0);
    }
}
